//! Parameters and chunk types exchanged with the engines.

use holo_types::{CueShape, ParticipantId};
use serde::{Deserialize, Serialize};

/// Raw mono PCM, signed 16-bit little-endian.
pub type Pcm = Vec<u8>;

/// Per-stream parameters for speech recognition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionParams {
    pub participant_id: ParticipantId,
    pub sample_rate: u32,
    pub language: Option<String>,
}

/// An incremental transcript from the recognition engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptUpdate {
    /// The full transcript so far, not a delta.
    pub text: String,
    pub confidence: f32,
    pub is_final: bool,
}

/// One prior exchange from the session's context window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub participant_id: ParticipantId,
    pub said: String,
    pub replied: String,
}

/// Per-turn parameters for response generation.
///
/// The prompt itself is fed as stream input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationParams {
    pub companion_id: String,
    pub persona: String,
    pub speaker: ParticipantId,
    pub history: Vec<Exchange>,
    /// Upper bound on the response length in characters.
    pub max_chars: usize,
}

/// Per-turn parameters for speech synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisParams {
    pub voice_id: String,
    pub speed: f32,
    pub sample_rate: u32,
}

/// A timing mark inside one synthesized chunk, relative to the chunk start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingMark {
    pub offset_ms: u64,
    pub duration_ms: u64,
    pub shape: CueShape,
}

/// Audio synthesized for one text chunk plus its timing marks.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisChunk {
    /// The text this audio speaks.
    pub text: String,
    pub sample_rate: u32,
    pub pcm: Pcm,
    /// Approximate playback duration, used to pace delivery.
    pub duration_ms: u64,
    pub marks: Vec<TimingMark>,
}
