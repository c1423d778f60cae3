//! Utterances and turns.

use crate::{AnimationCue, ParticipantId, TurnId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an utterance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceOrigin {
    /// Live speech transcribed by the recognition engine.
    Speech,
    /// Text typed by a participant.
    Text,
    /// A prompt injected by the platform.
    System,
}

/// One speech segment from one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub participant_id: ParticipantId,
    pub origin: UtteranceOrigin,
    /// Ingress timestamp of the first frame, in ms.
    pub started_at_ms: u64,
    /// Ingress timestamp of the last frame, once speech ended.
    pub ended_at_ms: Option<u64>,
    /// Total audio received for this utterance, in ms.
    pub audio_ms: u64,
    /// Incremental transcript; grows with each partial result.
    pub transcript: String,
    /// Engine confidence of the latest transcript, in `[0, 1]`.
    pub confidence: f32,
    pub finalized: bool,
}

impl Utterance {
    /// A speech utterance that just started.
    pub fn speech(participant_id: impl Into<ParticipantId>, started_at_ms: u64) -> Self {
        Self {
            participant_id: participant_id.into(),
            origin: UtteranceOrigin::Speech,
            started_at_ms,
            ended_at_ms: None,
            audio_ms: 0,
            transcript: String::new(),
            confidence: 0.0,
            finalized: false,
        }
    }

    /// An already-final utterance from typed or injected text.
    pub fn text(
        participant_id: impl Into<ParticipantId>,
        origin: UtteranceOrigin,
        text: impl Into<String>,
        at_ms: u64,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            origin,
            started_at_ms: at_ms,
            ended_at_ms: Some(at_ms),
            audio_ms: 0,
            transcript: text.into(),
            confidence: 1.0,
            finalized: true,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TurnCompletion {
    InProgress,
    /// The full response was generated, synthesized and acknowledged.
    Completed,
    /// A stage missed its deadline or failed; a fallback or truncated
    /// response was delivered instead.
    Degraded(String),
    /// A participant barged in and the turn was cancelled.
    Interrupted,
    /// The device did not come back within the grace period.
    Abandoned,
}

impl TurnCompletion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Degraded(_) => "degraded",
            Self::Interrupted => "interrupted",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Metadata for one delivered audio segment (the PCM itself lives on the link).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSpan {
    pub offset_ms: u64,
    pub duration_ms: u64,
    pub bytes: usize,
}

/// The accepted conversational exchange unit.
///
/// Built up while the pipeline runs; immutable once `completion` is final
/// and the turn has been appended to the session's context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub speaker: ParticipantId,
    pub input: String,
    pub response_text: String,
    pub audio: Vec<AudioSpan>,
    pub cues: Vec<AnimationCue>,
    pub completion: TurnCompletion,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// End-of-utterance to first audio handed to the device link.
    pub first_audio_latency_ms: Option<u64>,
}

impl Turn {
    pub fn new(id: TurnId, speaker: impl Into<ParticipantId>, input: impl Into<String>) -> Self {
        Self {
            id,
            speaker: speaker.into(),
            input: input.into(),
            response_text: String::new(),
            audio: Vec::new(),
            cues: Vec::new(),
            completion: TurnCompletion::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            first_audio_latency_ms: None,
        }
    }

    /// Total audio duration delivered for this turn.
    pub fn audio_ms(&self) -> u64 {
        self.audio.iter().map(|s| s.offset_ms + s.duration_ms).max().unwrap_or(0)
    }

    /// Marks the turn final. Later calls are ignored.
    pub fn finish(&mut self, completion: TurnCompletion) {
        if self.completion.is_final() {
            return;
        }
        self.completion = completion;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_is_sticky() {
        let mut turn = Turn::new(1, "alice", "hello");
        turn.finish(TurnCompletion::Interrupted);
        turn.finish(TurnCompletion::Completed);
        assert_eq!(turn.completion, TurnCompletion::Interrupted);
        assert!(turn.finished_at.is_some());
    }

    #[test]
    fn completion_serializes_with_reason() {
        let value = serde_json::to_value(TurnCompletion::Degraded("generation deadline".into()))
            .unwrap();
        assert_eq!(value["status"], "degraded");
        assert_eq!(value["reason"], "generation deadline");
        let done = serde_json::to_value(TurnCompletion::Completed).unwrap();
        assert_eq!(done["status"], "completed");
    }

    #[test]
    fn text_utterances_are_final() {
        let u = Utterance::text("bob", UtteranceOrigin::Text, "hi", 10);
        assert!(u.finalized);
        assert_eq!(u.ended_at_ms, Some(10));
    }
}
