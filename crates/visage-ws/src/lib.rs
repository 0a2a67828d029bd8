pub mod base64;
pub mod client;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod sha1;

pub use client::WsClient;
pub use error::WsError;
pub use frame::{read_frame, write_frame, write_masked_frame, Frame, Opcode};
pub use handshake::{accept_key, perform_client_handshake, perform_server_handshake};
pub use listener::listen;
