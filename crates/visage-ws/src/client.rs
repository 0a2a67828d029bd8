use crate::{
    frame::{read_frame, write_masked_frame, Frame, Opcode},
    handshake::perform_client_handshake,
    WsError,
};
use std::net::{TcpStream, ToSocketAddrs};
use uuid::Uuid;

/// A blocking WebSocket client. Writes are masked as RFC 6455 requires of
/// the client side; used by tooling and the integration tests.
pub struct WsClient {
    stream: TcpStream,
}

impl WsClient {
    /// Connect to `addr` (e.g. `"127.0.0.1:8765"`) and perform the opening
    /// handshake.
    pub fn connect(addr: &str) -> Result<Self, WsError> {
        let resolved = addr
            .to_socket_addrs()
            .map_err(|_| WsError::InvalidAddress(addr.to_string()))?
            .next()
            .ok_or_else(|| WsError::InvalidAddress(addr.to_string()))?;
        let mut stream = TcpStream::connect(resolved)?;
        stream.set_nodelay(true)?;
        perform_client_handshake(&mut stream, addr)?;
        Ok(Self { stream })
    }

    /// Send one masked frame.
    pub fn send(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), WsError> {
        let entropy = *Uuid::new_v4().as_bytes();
        let mask_key = [entropy[0], entropy[1], entropy[2], entropy[3]];
        write_masked_frame(&mut self.stream, opcode, payload, mask_key)
    }

    /// Receive one frame, capping the payload at `max_payload`.
    pub fn recv(&mut self, max_payload: usize) -> Result<Frame, WsError> {
        read_frame(&mut self.stream, max_payload)
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}
