use std::fmt;

#[derive(Debug)]
pub enum InferError {
    ModelLoad(String),
    InvalidDevice(i32),
    AccumulatorClosed,
    SizeMismatch { expected: usize, got: usize },
    Staging(String),
    Unsupported(String),
}

impl fmt::Display for InferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferError::ModelLoad(msg) => write!(f, "model load error: {msg}"),
            InferError::InvalidDevice(id) => write!(f, "invalid device: {id}"),
            InferError::AccumulatorClosed => write!(f, "accumulator is closed"),
            InferError::SizeMismatch { expected, got } => {
                write!(f, "size mismatch: expected {expected}, got {got}")
            }
            InferError::Staging(msg) => write!(f, "staging error: {msg}"),
            InferError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for InferError {}
