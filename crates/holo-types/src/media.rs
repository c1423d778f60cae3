//! Synthesized media and the payloads delivered to a device.

use crate::{TurnCompletion, TurnId};
use serde::{Deserialize, Serialize};

/// One chunk of synthesized speech, positioned on the turn's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSegment {
    /// Offset of the first sample from the start of the turn's audio, in ms.
    pub offset_ms: u64,
    /// Approximate playback duration in ms.
    pub duration_ms: u64,
    /// Sample rate of `pcm`.
    pub sample_rate: u32,
    /// Raw mono PCM, signed 16-bit little-endian.
    #[serde(with = "pcm_base64")]
    pub pcm: Vec<u8>,
}

impl AudioSegment {
    /// Duration implied by the PCM payload length and sample rate.
    pub fn pcm_duration_ms(pcm_len: usize, sample_rate: u32) -> u64 {
        if sample_rate == 0 {
            return 0;
        }
        (pcm_len as u64 / 2) * 1000 / sample_rate as u64
    }

    /// End of this segment on the turn timeline.
    pub fn end_ms(&self) -> u64 {
        self.offset_ms + self.duration_ms
    }
}

/// What an animation cue asks the renderer to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CueShape {
    /// A mouth shape for lip-sync (e.g. `"AA"`, `"FV"`, `"sil"`).
    Viseme(String),
    /// A facial expression or gesture (e.g. `"smile"`, `"nod"`).
    Expression(String),
}

/// A `(timestamp-offset, viseme-or-expression, duration)` triple.
///
/// Offsets are relative to the start of the owning turn's audio; cues are
/// delivered in non-decreasing `offset_ms` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationCue {
    pub offset_ms: u64,
    pub shape: CueShape,
    pub duration_ms: u64,
}

impl AnimationCue {
    pub fn viseme(offset_ms: u64, id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            offset_ms,
            shape: CueShape::Viseme(id.into()),
            duration_ms,
        }
    }

    pub fn expression(offset_ms: u64, id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            offset_ms,
            shape: CueShape::Expression(id.into()),
            duration_ms,
        }
    }
}

/// Everything a device link can carry for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DevicePayload {
    /// Marks the beginning of a turn's media.
    TurnStart { turn_id: TurnId },
    /// A chunk of speech audio.
    Audio {
        turn_id: TurnId,
        #[serde(flatten)]
        segment: AudioSegment,
    },
    /// An animation cue aligned to the turn's audio.
    Cue {
        turn_id: TurnId,
        #[serde(flatten)]
        cue: AnimationCue,
    },
    /// Text-only degraded response when no audio could be produced.
    Fallback { turn_id: TurnId, text: String },
    /// Marks the end of a turn's media.
    TurnEnd {
        turn_id: TurnId,
        completion: TurnCompletion,
    },
}

impl DevicePayload {
    /// The turn this payload belongs to.
    pub fn turn_id(&self) -> TurnId {
        match self {
            Self::TurnStart { turn_id }
            | Self::Audio { turn_id, .. }
            | Self::Cue { turn_id, .. }
            | Self::Fallback { turn_id, .. }
            | Self::TurnEnd { turn_id, .. } => *turn_id,
        }
    }

    /// Timeline position used for ordering checks, if the payload has one.
    pub fn offset_ms(&self) -> Option<u64> {
        match self {
            Self::Audio { segment, .. } => Some(segment.offset_ms),
            Self::Cue { cue, .. } => Some(cue.offset_ms),
            _ => None,
        }
    }
}

mod pcm_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
