//! Wire messages exchanged with a device.
//!
//! Server to device: one JSON object per frame, the [`DevicePayload`] fields
//! flattened next to `seq`. Device to server: `{"type":"ack","seq":N}`.

use holo_types::DevicePayload;
use serde::{Deserialize, Serialize};

/// One sequenced outbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub payload: DevicePayload,
}

/// Messages a device may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Everything up to and including `seq` has been received.
    Ack { seq: u64 },
    /// Keep-alive with no other effect.
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;
    use holo_types::{AnimationCue, TurnCompletion};

    #[test]
    fn frame_flattens_payload() {
        let frame = OutboundFrame {
            seq: 7,
            payload: DevicePayload::Cue {
                turn_id: 2,
                cue: AnimationCue::expression(40, "smile", 500),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["type"], "cue");
        assert_eq!(value["shape"]["id"], "smile");

        let back: OutboundFrame = serde_json::from_value(value).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn turn_end_frame_shape() {
        let frame = OutboundFrame {
            seq: 12,
            payload: DevicePayload::TurnEnd {
                turn_id: 3,
                completion: TurnCompletion::Completed,
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "turn_end");
        assert_eq!(value["completion"]["status"], "completed");
    }

    #[test]
    fn parses_device_messages() {
        let ack: InboundMessage = serde_json::from_str(r#"{"type":"ack","seq":41}"#).unwrap();
        assert_eq!(ack, InboundMessage::Ack { seq: 41 });
        let ping: InboundMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, InboundMessage::Ping);
        assert!(serde_json::from_str::<InboundMessage>(r#"{"type":"nack"}"#).is_err());
    }
}
