//! The gossip wire protocol: newline-delimited JSON over TCP.
//!
//! One frame per line, no other framing. Unknown message types are ignored
//! so newer peers can add messages; compatibility is additive fields only,
//! no version negotiation. Malformed frames are dropped with a counter;
//! frames beyond the configured maximum abort the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use senseye_core::Belief;
use senseye_env::{NodeId, Role};

/// Default gossip TCP port.
pub const DEFAULT_PORT: u16 = 5483;

/// Default maximum frame length in bytes.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// All frames a node understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Connection handshake, sent once after connect in both directions.
    Announce {
        node_id: NodeId,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<[f64; 2]>,
    },

    /// A belief emission or relay. The internally-tagged representation
    /// puts the belief fields flat beside `type`.
    Belief(Box<Belief>),

    /// Request that the receiver chirp in the given band after `delay_s`.
    AcousticPing {
        request_id: String,
        delay_s: f64,
        sample_rate: u32,
        freq_start: f64,
        freq_end: f64,
        chirp_duration: f64,
    },

    /// Reply to an acoustic ping.
    AcousticPong {
        request_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Outcome of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Message(WireMessage),
    /// Parsed JSON with a `type` we do not know: ignored, not an error.
    UnknownType,
    /// Not JSON, or a known type with a broken shape.
    Malformed,
}

const KNOWN_TYPES: [&str; 4] = ["announce", "belief", "acoustic_ping", "acoustic_pong"];

/// Encodes a message as one newline-terminated frame.
pub fn encode(message: &WireMessage) -> Result<String, serde_json::Error> {
    let mut frame = serde_json::to_string(message)?;
    frame.push('\n');
    Ok(frame)
}

/// Decodes one frame (without the trailing newline).
pub fn decode(line: &str) -> DecodeOutcome {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return DecodeOutcome::Malformed;
    };
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return DecodeOutcome::Malformed;
    };
    if !KNOWN_TYPES.contains(&kind) {
        return DecodeOutcome::UnknownType;
    }
    match serde_json::from_value::<WireMessage>(value) {
        Ok(message) => DecodeOutcome::Message(message),
        Err(_) => DecodeOutcome::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_round_trip() {
        let msg = WireMessage::Announce {
            node_id: NodeId::new("kitchen"),
            role: Role::Fixed,
            position: Some([1.0, 2.0]),
        };
        let frame = encode(&msg).unwrap();
        assert!(frame.ends_with('\n'));
        assert_eq!(decode(frame.trim_end()), DecodeOutcome::Message(msg));
    }

    #[test]
    fn announce_wire_shape() {
        let msg = WireMessage::Announce {
            node_id: NodeId::new("kitchen"),
            role: Role::Mobile,
            position: None,
        };
        let value: Value = serde_json::from_str(encode(&msg).unwrap().trim_end()).unwrap();
        assert_eq!(value["type"], "announce");
        assert_eq!(value["role"], "mobile");
        assert!(value.get("position").is_none());
    }

    #[test]
    fn belief_frame_is_flat() {
        let belief = Belief::empty(NodeId::new("atrium"), 9, 2, 123.0);
        let frame = encode(&WireMessage::Belief(Box::new(belief.clone()))).unwrap();
        let value: Value = serde_json::from_str(frame.trim_end()).unwrap();
        // Belief fields sit beside "type", not nested.
        assert_eq!(value["type"], "belief");
        assert_eq!(value["node_id"], "atrium");
        assert_eq!(value["sequence_number"], 9);
        assert_eq!(value["hop_count"], 2);

        match decode(frame.trim_end()) {
            DecodeOutcome::Message(WireMessage::Belief(decoded)) => {
                assert_eq!(*decoded, belief);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_ignored_not_malformed() {
        assert_eq!(
            decode(r#"{"type":"future_feature","payload":42}"#),
            DecodeOutcome::UnknownType
        );
    }

    #[test]
    fn malformed_frames_are_flagged() {
        assert_eq!(decode("not json at all"), DecodeOutcome::Malformed);
        assert_eq!(decode(r#"{"no_type":1}"#), DecodeOutcome::Malformed);
        // Known type, broken shape.
        assert_eq!(
            decode(r#"{"type":"belief","node_id":17}"#),
            DecodeOutcome::Malformed
        );
    }

    #[test]
    fn acoustic_ping_pong_round_trip() {
        let ping = WireMessage::AcousticPing {
            request_id: "req-1".into(),
            delay_s: 0.5,
            sample_rate: 48_000,
            freq_start: 18_000.0,
            freq_end: 19_000.0,
            chirp_duration: 0.05,
        };
        let pong = WireMessage::AcousticPong {
            request_id: "req-1".into(),
            ok: false,
            error: Some("no speaker".into()),
        };
        for msg in [ping, pong] {
            let frame = encode(&msg).unwrap();
            assert_eq!(decode(frame.trim_end()), DecodeOutcome::Message(msg));
        }
    }
}
