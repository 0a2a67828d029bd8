//! WebSocket opening handshake, server and client halves.

use crate::{base64, sha1::sha1, WsError};
use std::io::{ErrorKind, Read, Write};
use uuid::Uuid;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the HTTP request/response head during the handshake.
pub const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

/// Compute `Sec-WebSocket-Accept` for a client `Sec-WebSocket-Key`.
pub fn accept_key(sec_websocket_key: &str) -> String {
    let mut combined = String::with_capacity(sec_websocket_key.len() + ACCEPT_GUID.len());
    combined.push_str(sec_websocket_key);
    combined.push_str(ACCEPT_GUID);
    base64::encode(&sha1(combined.as_bytes()))
}

/// Read from `stream` until the header terminator, capped at
/// [`MAX_HANDSHAKE_BYTES`].
fn read_head<S: Read>(stream: &mut S) -> Result<String, WsError> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while head.len() < MAX_HANDSHAKE_BYTES {
        let received = match stream.read(&mut buf) {
            Ok(0) => return Err(WsError::ConnectionClosed),
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(WsError::Io(err)),
        };
        head.extend_from_slice(&buf[..received]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(String::from_utf8_lossy(&head).into_owned());
        }
    }
    Err(WsError::HandshakeFailed("request head too large".into()))
}

/// Split a header line into a lowercased name and a trimmed value.
fn parse_header(line: &str) -> Option<(String, &str)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim().to_ascii_lowercase(), value.trim()))
}

/// Perform the server side of the opening handshake: require
/// `Upgrade: websocket` and a non-empty `Sec-WebSocket-Key`, then answer
/// `101 Switching Protocols` with the computed accept key.
pub fn perform_server_handshake<S: Read + Write>(stream: &mut S) -> Result<(), WsError> {
    let request = read_head(stream)?;

    let mut sec_key = String::new();
    let mut is_websocket = false;
    for line in request.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = parse_header(line) else {
            continue;
        };
        if name == "sec-websocket-key" {
            sec_key = value.to_string();
        } else if name == "upgrade" && value.eq_ignore_ascii_case("websocket") {
            is_websocket = true;
        }
    }

    if !is_websocket {
        return Err(WsError::HandshakeFailed("missing Upgrade: websocket".into()));
    }
    if sec_key.is_empty() {
        return Err(WsError::HandshakeFailed("missing Sec-WebSocket-Key".into()));
    }

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(&sec_key)
    );
    stream.write_all(response.as_bytes())?;
    Ok(())
}

/// Perform the client side of the opening handshake against `host`.
///
/// Sends a random 16-byte key and verifies the server's
/// `Sec-WebSocket-Accept` echo before returning.
pub fn perform_client_handshake<S: Read + Write>(stream: &mut S, host: &str) -> Result<(), WsError> {
    let key = base64::encode(Uuid::new_v4().as_bytes());
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes())?;

    let response = read_head(stream)?;
    let mut lines = response.split("\r\n");
    let status = lines.next().unwrap_or("");
    if !status.contains("101") {
        return Err(WsError::HandshakeFailed(format!("unexpected status: {status}")));
    }

    let expected = accept_key(&key);
    let accepted = lines
        .take_while(|line| !line.is_empty())
        .filter_map(parse_header)
        .any(|(name, value)| name == "sec-websocket-accept" && value == expected);
    if !accepted {
        return Err(WsError::HandshakeFailed("Sec-WebSocket-Accept mismatch".into()));
    }
    Ok(())
}
