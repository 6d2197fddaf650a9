//! Kingsmith wire codec.
//!
//! Pure, side-effect-free encode/decode of the proprietary Kingsmith/
//! WalkingPad frame format:
//!
//! ```text
//! 0xF7  <opcode>  <payload...>  <checksum>  0xFD
//! ```
//!
//! `checksum` is the 8-bit sum of `opcode` and every payload byte, modulo
//! 256. Nothing in this module touches BLE, timers, or shared state — it is
//! exercised entirely by the unit tests below.

use serde::{Deserialize, Serialize};

const SYNC_START: u8 = 0xF7;
const SYNC_END: u8 = 0xFD;

/// Canonical "ask status" request opcode.
pub const OPCODE_ASK_STATS: u8 = 0xA1;
/// Opcode marking a stats reply.
pub const OPCODE_STATS_REPLY: u8 = 0xA2;

/// Belt motion state reported by the treadmill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeltState {
    Idle,
    Running,
    Paused,
    Unknown,
}

impl BeltState {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => BeltState::Idle,
            1 => BeltState::Running,
            2 => BeltState::Paused,
            _ => BeltState::Unknown,
        }
    }
}

/// Which width the treadmill used to encode instantaneous speed. A1/R1/R2
/// units differ here; rather than assume one, the codec records what it
/// actually observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedEncoding {
    OneByte,
    TwoByte,
}

/// A decoded "ask stats" response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReply {
    pub belt_state: BeltState,
    pub speed_raw_decikmh: u16,
    pub distance_raw_decameters: u16,
    pub elapsed_s: u16,
    pub speed_encoding: SpeedEncoding,
}

impl StatsReply {
    pub fn speed_kmh(&self) -> f64 {
        self.speed_raw_decikmh as f64 / 10.0
    }

    pub fn distance_m(&self) -> u32 {
        self.distance_raw_decameters as u32 * 10
    }
}

/// Result of decoding an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedFrame {
    StatsReply(StatsReply),
    /// A non-stats control response, identified only by its opcode — the
    /// bridge never issues control writes beyond `ask_stats`, so this is
    /// currently only ever the echoed `ask_stats` opcode.
    ControlReply { opcode: u8 },
    Unknown,
}

fn checksum(opcode: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(opcode, |acc, &b| acc.wrapping_add(b))
}

fn build_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.push(SYNC_START);
    buf.push(opcode);
    buf.extend_from_slice(payload);
    buf.push(checksum(opcode, payload));
    buf.push(SYNC_END);
    buf
}

/// Validate the envelope (sync bytes + checksum) and, if valid, split the
/// frame into `(opcode, payload)`.
fn validate_envelope(bytes: &[u8]) -> Option<(u8, &[u8])> {
    if bytes.len() < 4 {
        return None;
    }
    if bytes[0] != SYNC_START || bytes[bytes.len() - 1] != SYNC_END {
        return None;
    }
    let opcode = bytes[1];
    let payload = &bytes[2..bytes.len() - 2];
    let checksum_byte = bytes[bytes.len() - 2];
    if checksum(opcode, payload) != checksum_byte {
        return None;
    }
    Some((opcode, payload))
}

/// Encode the canonical "ask status" request frame.
pub fn encode_ask_stats() -> Vec<u8> {
    build_frame(OPCODE_ASK_STATS, &[])
}

/// Decode an inbound frame. Never panics; malformed input always yields
/// `Unknown` rather than an error, per the codec's "never throws" contract.
pub fn decode_frame(bytes: &[u8]) -> DecodedFrame {
    let Some((opcode, payload)) = validate_envelope(bytes) else {
        return DecodedFrame::Unknown;
    };

    match opcode {
        OPCODE_STATS_REPLY => decode_stats_payload(payload).unwrap_or(DecodedFrame::Unknown),
        OPCODE_ASK_STATS => DecodedFrame::ControlReply { opcode },
        _ => DecodedFrame::Unknown,
    }
}

/// The A1/R1/R2 family differs in whether instantaneous speed is a single
/// decikm/h byte or a little-endian uint16 — we accept either by payload
/// length rather than guessing a model.
fn decode_stats_payload(payload: &[u8]) -> Option<DecodedFrame> {
    let (belt_byte, speed_raw, distance_raw, elapsed_s, encoding) = match payload.len() {
        6 => {
            let belt = payload[0];
            let speed = payload[1] as u16;
            let distance = u16::from_le_bytes([payload[2], payload[3]]);
            let elapsed = u16::from_le_bytes([payload[4], payload[5]]);
            (belt, speed, distance, elapsed, SpeedEncoding::OneByte)
        }
        7 => {
            let belt = payload[0];
            let speed = u16::from_le_bytes([payload[1], payload[2]]);
            let distance = u16::from_le_bytes([payload[3], payload[4]]);
            let elapsed = u16::from_le_bytes([payload[5], payload[6]]);
            (belt, speed, distance, elapsed, SpeedEncoding::TwoByte)
        }
        _ => return None,
    };

    Some(DecodedFrame::StatsReply(StatsReply {
        belt_state: BeltState::from_byte(belt_byte),
        speed_raw_decikmh: speed_raw,
        distance_raw_decameters: distance_raw,
        elapsed_s,
        speed_encoding: encoding,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ask_stats_roundtrips_opcode() {
        let frame = encode_ask_stats();
        match decode_frame(&frame) {
            DecodedFrame::ControlReply { opcode } => assert_eq!(opcode, OPCODE_ASK_STATS),
            other => panic!("expected ControlReply, got {:?}", other),
        }
    }

    #[test]
    fn test_checksum_example_frame_decodes() {
        // F7 A2 01 02 03 A8 FD: 0xA2+0x01+0x02+0x03 = 0xA8
        let frame = [0xF7, 0xA2, 0x01, 0x02, 0x03, 0xA8, 0xFD];
        let (opcode, payload) = validate_envelope(&frame).expect("checksum should validate");
        assert_eq!(opcode, 0xA2);
        assert_eq!(payload, &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_checksum_corrupted_byte_rejected() {
        let mut frame = [0xF7, 0xA2, 0x01, 0x02, 0x03, 0xA8, 0xFD];
        frame[5] = 0xA9; // flip checksum byte
        assert!(validate_envelope(&frame).is_none());
        assert_eq!(decode_frame(&frame), DecodedFrame::Unknown);
    }

    #[test]
    fn test_decode_stats_reply_one_byte_speed() {
        // belt=running, speed=125 (12.5 km/h), distance=42 decameters (420m), elapsed=600s
        let payload = [0x01, 125, 42, 0x00, 0x58, 0x02];
        let frame = build_frame(OPCODE_STATS_REPLY, &payload);
        match decode_frame(&frame) {
            DecodedFrame::StatsReply(reply) => {
                assert_eq!(reply.belt_state, BeltState::Running);
                assert_eq!(reply.speed_encoding, SpeedEncoding::OneByte);
                assert!((reply.speed_kmh() - 12.5).abs() < f64::EPSILON);
                assert_eq!(reply.distance_m(), 420);
                assert_eq!(reply.elapsed_s, 600);
            }
            other => panic!("expected StatsReply, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_stats_reply_two_byte_speed() {
        // belt=paused, speed=1250 decikm/h (125.0 km/h, exercising the wide encoding),
        // distance=1000 decameters (10000m), elapsed=3599s
        let speed_bytes = 1250u16.to_le_bytes();
        let payload = [0x02, speed_bytes[0], speed_bytes[1], 0xE8, 0x03, 0x0F, 0x0E];
        let frame = build_frame(OPCODE_STATS_REPLY, &payload);
        match decode_frame(&frame) {
            DecodedFrame::StatsReply(reply) => {
                assert_eq!(reply.belt_state, BeltState::Paused);
                assert_eq!(reply.speed_encoding, SpeedEncoding::TwoByte);
                assert_eq!(reply.distance_m(), 10000);
                assert_eq!(reply.elapsed_s, 3599);
            }
            other => panic!("expected StatsReply, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_stats_reply_unknown_belt_byte() {
        let payload = [0xFF, 0, 0, 0, 0, 0];
        let frame = build_frame(OPCODE_STATS_REPLY, &payload);
        match decode_frame(&frame) {
            DecodedFrame::StatsReply(reply) => assert_eq!(reply.belt_state, BeltState::Unknown),
            other => panic!("expected StatsReply, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_stats_reply_wrong_payload_length_is_unknown() {
        let payload = [0x00, 0x00, 0x00];
        let frame = build_frame(OPCODE_STATS_REPLY, &payload);
        assert_eq!(decode_frame(&frame), DecodedFrame::Unknown);
    }

    #[test]
    fn test_unrecognized_opcode_is_unknown() {
        let frame = build_frame(0xFF, &[1, 2, 3]);
        assert_eq!(decode_frame(&frame), DecodedFrame::Unknown);
    }

    #[test]
    fn test_malformed_sync_bytes() {
        let mut frame = build_frame(OPCODE_STATS_REPLY, &[0, 1, 2, 3, 4, 5]);
        frame[0] = 0x00;
        assert_eq!(decode_frame(&frame), DecodedFrame::Unknown);

        let mut frame = build_frame(OPCODE_STATS_REPLY, &[0, 1, 2, 3, 4, 5]);
        *frame.last_mut().unwrap() = 0x00;
        assert_eq!(decode_frame(&frame), DecodedFrame::Unknown);
    }

    #[test]
    fn test_too_short_is_unknown() {
        for len in 0..4 {
            let frame = vec![0u8; len];
            assert_eq!(decode_frame(&frame), DecodedFrame::Unknown);
        }
    }

    #[test]
    fn test_single_byte_flip_breaks_checksum() {
        // Flipping any single interior byte (opcode or payload) of a valid
        // frame changes the checksum sum and must yield Unknown, with at
        // most one flipped bit-pattern per byte (out of 255 possible
        // non-identity flips) coincidentally producing a colliding sum —
        // i.e. failure probability >= 255/256 as specified.
        let payload = [0x01, 100, 10, 0x00, 0x2C, 0x01];
        let good = build_frame(OPCODE_STATS_REPLY, &payload);
        assert!(matches!(decode_frame(&good), DecodedFrame::StatsReply(_)));

        // interior bytes are opcode (index 1) through payload end (index 7)
        for idx in 1..(good.len() - 2) {
            let mut broken_count = 0;
            let mut total = 0;
            for delta in 1u16..=255 {
                let mut frame = good.clone();
                frame[idx] = frame[idx].wrapping_add(delta as u8);
                total += 1;
                if decode_frame(&frame) == DecodedFrame::Unknown {
                    broken_count += 1;
                }
            }
            assert!(
                broken_count * 256 >= total * 255,
                "byte {idx}: only {broken_count}/{total} flips broke decoding"
            );
        }
    }

    #[test]
    fn test_random_garbage_never_panics() {
        // Deterministic pseudo-random sweep standing in for a fuzz run —
        // the codec must never panic on arbitrary 16-byte buffers.
        let mut seed: u64 = 0x1234_5678_9abc_def0;
        for _ in 0..1000 {
            let mut buf = [0u8; 16];
            for b in buf.iter_mut() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                *b = (seed >> 56) as u8;
            }
            let _ = decode_frame(&buf);
        }
    }
}
