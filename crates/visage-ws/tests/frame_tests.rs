use std::io::Cursor;
use visage_ws::frame::{read_frame, write_frame, write_masked_frame, Frame, Opcode};
use visage_ws::WsError;

const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

fn round_trip(opcode: Opcode, payload: Vec<u8>) -> Frame {
    let mut wire = Vec::new();
    write_frame(&mut wire, opcode, &payload).expect("write failed");
    read_frame(&mut Cursor::new(wire), MAX_PAYLOAD).expect("read failed")
}

#[test]
fn test_round_trip_length_boundaries() {
    // Covers the 7-bit, 16-bit and 64-bit length encodings
    for len in [0usize, 1, 125, 126, 127, 65535, 65536, 1_048_576] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let frame = round_trip(Opcode::Binary, payload.clone());
        assert_eq!(frame.opcode, Opcode::Binary, "len {len}");
        assert_eq!(frame.payload, payload, "len {len}");
    }
}

#[test]
fn test_round_trip_text_opcode() {
    let frame = round_trip(Opcode::Text, b"{\"type\":\"StartSession\"}".to_vec());
    assert_eq!(frame.opcode, Opcode::Text);
}

#[test]
fn test_masked_frame_unmasks_to_original() {
    let payload: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
    let mut wire = Vec::new();
    write_masked_frame(&mut wire, Opcode::Binary, &payload, [0xde, 0xad, 0xbe, 0xef])
        .expect("write failed");

    // Mask bit must be set on the wire and the payload scrambled
    assert_eq!(wire[1] & 0x80, 0x80);
    assert_ne!(&wire[wire.len() - payload.len()..], payload.as_slice());

    let frame = read_frame(&mut Cursor::new(wire), MAX_PAYLOAD).expect("read failed");
    assert_eq!(frame.payload, payload);
}

#[test]
fn test_fragmented_frame_rejected() {
    let mut wire = Vec::new();
    write_frame(&mut wire, Opcode::Binary, b"abc").unwrap();
    wire[0] &= 0x7f; // clear FIN
    assert!(matches!(
        read_frame(&mut Cursor::new(wire), MAX_PAYLOAD),
        Err(WsError::Fragmented)
    ));
}

#[test]
fn test_oversized_payload_rejected_before_read() {
    let mut wire = Vec::new();
    write_frame(&mut wire, Opcode::Binary, &vec![0u8; 2048]).unwrap();
    assert!(matches!(
        read_frame(&mut Cursor::new(wire), 1024),
        Err(WsError::PayloadTooLarge(2048))
    ));
}

#[test]
fn test_unknown_opcode_rejected() {
    let wire = vec![0x83, 0x00]; // FIN + reserved opcode 0x3
    assert!(matches!(
        read_frame(&mut Cursor::new(wire), MAX_PAYLOAD),
        Err(WsError::UnknownOpcode(0x3))
    ));
}

#[test]
fn test_short_read_is_connection_closed() {
    let mut wire = Vec::new();
    write_frame(&mut wire, Opcode::Binary, b"abcdef").unwrap();
    wire.truncate(wire.len() - 3); // lose half the payload
    assert!(matches!(
        read_frame(&mut Cursor::new(wire), MAX_PAYLOAD),
        Err(WsError::ConnectionClosed)
    ));
}

#[test]
fn test_empty_stream_is_connection_closed() {
    assert!(matches!(
        read_frame(&mut Cursor::new(Vec::new()), MAX_PAYLOAD),
        Err(WsError::ConnectionClosed)
    ));
}

#[test]
fn test_server_frames_are_unmasked() {
    let mut wire = Vec::new();
    write_frame(&mut wire, Opcode::Pong, b"hi").unwrap();
    assert_eq!(wire, vec![0x8A, 0x02, b'h', b'i']);
}
