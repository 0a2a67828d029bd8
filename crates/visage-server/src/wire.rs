//! Binary wire formats and control-message helpers.
//!
//! PushAudio (client to server), little-endian:
//! ```text
//! [0..8)  start_sample_index : i64
//! [8..)   PCM16 mono samples
//! ```
//!
//! BlendshapeFrame (server to client), little-endian, 40-byte header:
//! ```text
//! [0..4)   magic 0x42463241
//! [4..8)   version
//! [8..12)  weight_count
//! [12..16) reserved
//! [16..24) frame_index : u64
//! [24..32) timestamp_current : i64
//! [32..40) timestamp_next : i64
//! [40..)   weights : f32 * weight_count
//! ```

use serde_json::{json, Value};
use std::io::Write;
use visage_ws::{write_frame, Opcode, WsError};

/// ASCII "A2FB".
pub const FRAME_MAGIC: u32 = 0x4246_3241;
pub const PROTOCOL_VERSION: u32 = 1;

pub const BLENDSHAPE_HEADER_BYTES: usize = 40;

/// Decode a PushAudio payload into `(start_sample_index, pcm)`.
pub fn decode_push_audio(payload: &[u8]) -> Option<(i64, Vec<i16>)> {
    if payload.len() < 8 || (payload.len() - 8) % 2 != 0 {
        return None;
    }
    let start_sample = i64::from_le_bytes(payload[..8].try_into().ok()?);
    let pcm = payload[8..]
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some((start_sample, pcm))
}

/// Encode one BlendshapeFrame message.
pub fn encode_blendshape_frame(
    frame_index: u64,
    timestamp_current: i64,
    timestamp_next: i64,
    weights: &[f32],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(BLENDSHAPE_HEADER_BYTES + weights.len() * 4);
    payload.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    payload.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    payload.extend_from_slice(&(weights.len() as u32).to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&frame_index.to_le_bytes());
    payload.extend_from_slice(&timestamp_current.to_le_bytes());
    payload.extend_from_slice(&timestamp_next.to_le_bytes());
    for weight in weights {
        payload.extend_from_slice(&weight.to_le_bytes());
    }
    payload
}

/// Send a control message as a Text frame.
pub fn send_json<S: Write>(stream: &mut S, message: &Value) -> Result<(), WsError> {
    write_frame(stream, Opcode::Text, message.to_string().as_bytes())
}

pub fn error_message(message: &str) -> Value {
    json!({"type": "Error", "message": message})
}

pub fn session_ended(session_id: &str) -> Value {
    json!({"type": "SessionEnded", "session_id": session_id})
}
