use std::fmt;

#[derive(Debug)]
pub enum WsError {
    Io(std::io::Error),
    ConnectionClosed,
    InvalidAddress(String),
    HandshakeFailed(String),
    Fragmented,
    PayloadTooLarge(u64),
    UnknownOpcode(u8),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsError::Io(err) => write!(f, "io error: {err}"),
            WsError::ConnectionClosed => write!(f, "connection closed"),
            WsError::InvalidAddress(addr) => write!(f, "invalid address: {addr}"),
            WsError::HandshakeFailed(msg) => write!(f, "handshake failed: {msg}"),
            WsError::Fragmented => write!(f, "fragmented frames are not supported"),
            WsError::PayloadTooLarge(len) => write!(f, "payload too large: {len} bytes"),
            WsError::UnknownOpcode(op) => write!(f, "unknown opcode: {op:#04x}"),
        }
    }
}

impl std::error::Error for WsError {}

impl From<std::io::Error> for WsError {
    fn from(err: std::io::Error) -> Self {
        WsError::Io(err)
    }
}
