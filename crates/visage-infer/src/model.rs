use crate::InferError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// On-disk model description. The gateway loads this once at startup; every
/// session slot is built from the same description.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelDescription {
    pub name: String,
    pub sampling_rate: u32,
    pub emotion_size: usize,
    pub skin: SolverDescription,
    pub tongue: SolverDescription,
}

/// One blendshape solver: an ordered list of pose names.
#[derive(Debug, Clone, Deserialize)]
pub struct SolverDescription {
    pub poses: Vec<String>,
}

impl ModelDescription {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InferError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| InferError::ModelLoad(format!("{}: {err}", path.display())))?;
        let description: ModelDescription = serde_json::from_str(&text)
            .map_err(|err| InferError::ModelLoad(format!("{}: {err}", path.display())))?;

        if description.sampling_rate == 0 {
            return Err(InferError::ModelLoad(format!(
                "{}: sampling_rate must be > 0",
                path.display()
            )));
        }
        Ok(description)
    }
}
