pub mod accumulator;
pub mod device;
pub mod error;
pub mod executor;
pub mod model;

pub use accumulator::{AudioAccumulator, EmotionAccumulator};
pub use device::{current_device, set_device, DeviceTensor, PinnedBuffer, Stream};
pub use error::InferError;
pub use executor::{DeviceResults, ExecutionOption, ExecutorBundle, ResultsSink, ResultsType};
pub use model::{ModelDescription, SolverDescription};
