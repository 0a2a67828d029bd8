//! Per-connection worker: handshake, then the dispatch loop.
//!
//! A connection holds at most one session slot. Codec failures (oversized,
//! fragmented, short read) end the connection; protocol and session errors
//! are answered with an Error message and the loop continues.

use crate::config::validate_start_session;
use crate::pool::SessionPool;
use crate::wire;
use serde_json::Value;
use std::net::TcpStream;
use std::sync::Arc;
use visage_ws::{perform_server_handshake, read_frame, write_frame, Opcode};

/// Per-message payload cap.
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// Run one connection to completion. Releases any held slot on teardown.
pub fn handle_client(stream: TcpStream, pool: Arc<SessionPool>) {
    if let Err(err) = stream.set_nodelay(true) {
        log::warn!("Failed to set TCP_NODELAY: {err}");
    }
    let stream = Arc::new(stream);

    if let Err(err) = perform_server_handshake(&mut &*stream) {
        log::debug!("WebSocket handshake failed: {err}");
        return;
    }

    let mut session_index: Option<usize> = None;

    loop {
        let frame = match read_frame(&mut &*stream, MAX_PAYLOAD_BYTES) {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("Connection ended: {err}");
                break;
            }
        };

        match frame.opcode {
            Opcode::Ping => {
                let _ = write_frame(&mut &*stream, Opcode::Pong, &frame.payload);
            }
            Opcode::Pong => {}
            Opcode::Close => {
                let _ = write_frame(&mut &*stream, Opcode::Close, &[]);
                break;
            }
            Opcode::Text => handle_text(&stream, &pool, &mut session_index, &frame.payload),
            Opcode::Binary => handle_binary(&stream, &pool, &session_index, &frame.payload),
        }
    }

    if let Some(index) = session_index {
        pool.release(index);
    }
}

fn reply(stream: &Arc<TcpStream>, message: &Value) {
    if let Err(err) = wire::send_json(&mut &**stream, message) {
        log::debug!("Failed to send control message: {err}");
    }
}

fn reply_error(stream: &Arc<TcpStream>, message: &str) {
    reply(stream, &wire::error_message(message));
}

fn handle_text(
    stream: &Arc<TcpStream>,
    pool: &Arc<SessionPool>,
    session_index: &mut Option<usize>,
    payload: &[u8],
) {
    let message: Value = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(err) => {
            reply_error(stream, &format!("Invalid JSON: {err}"));
            return;
        }
    };

    match message.get("type").and_then(Value::as_str).unwrap_or("") {
        "StartSession" => {
            if session_index.is_some() {
                reply_error(stream, "Session already started for this connection");
                return;
            }

            let Some(index) = pool.acquire(stream.clone()) else {
                reply_error(stream, "Server busy (no free sessions)");
                return;
            };

            let started = pool.get(index).describe_session_started();
            if let Err(validation_error) = validate_start_session(&message, &started) {
                pool.release(index);
                reply_error(stream, &validation_error);
                return;
            }

            *session_index = Some(index);
            reply(stream, &started);
        }
        "EndSession" => {
            let Some(index) = *session_index else {
                reply_error(stream, "No active session for this connection");
                return;
            };

            let session_id = pool.get(index).session_id();
            if let Some(requested_id) = message.get("session_id") {
                let Some(requested_id) = requested_id.as_str() else {
                    reply_error(stream, "EndSession.session_id must be a string");
                    return;
                };
                if requested_id != session_id {
                    reply_error(stream, "EndSession.session_id does not match active session");
                    return;
                }
            }

            pool.release(index);
            *session_index = None;
            reply(stream, &wire::session_ended(&session_id));
        }
        _ => reply_error(stream, "Unknown message type"),
    }
}

fn handle_binary(
    stream: &Arc<TcpStream>,
    pool: &Arc<SessionPool>,
    session_index: &Option<usize>,
    payload: &[u8],
) {
    let Some(index) = *session_index else {
        reply_error(stream, "StartSession must be called before PushAudio");
        return;
    };

    let Some((start_sample_index, pcm)) = wire::decode_push_audio(payload) else {
        reply_error(stream, "Invalid PushAudio binary payload");
        return;
    };

    // Session errors have already been reported on the socket
    let _ = pool.get(index).push_audio(start_sample_index, &pcm);
}
