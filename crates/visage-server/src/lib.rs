pub mod config;
pub mod handler;
pub mod pool;
pub mod session;
pub mod wire;

pub use config::{Args, ServerConfig};
pub use handler::{handle_client, MAX_PAYLOAD_BYTES};
pub use pool::SessionPool;
pub use session::{SessionContext, SessionError};
