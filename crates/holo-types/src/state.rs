//! Session state machine labels.

use serde::{Deserialize, Serialize};

/// The state of one conversational session.
///
/// The happy path is `Idle → Listening → Recognizing → Generating →
/// Synthesizing → Responding → Idle`. `Interrupted` and `Reconnecting` are
/// side states entered from any live state, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no input observed yet (or a turn just completed).
    Idle,
    /// Audio is arriving; no participant holds the turn.
    Listening,
    /// A participant holds the turn and their utterance is being transcribed.
    Recognizing,
    /// The finalized transcript is being answered by the language model.
    Generating,
    /// Response text is being converted to audio and timing marks.
    Synthesizing,
    /// Audio and animation cues are being delivered to the device.
    Responding,
    /// A participant barged in; in-flight stages are being cancelled.
    Interrupted,
    /// The device link dropped; pending delivery is held for the grace period.
    Reconnecting,
    /// Terminal. All resources released.
    Closed,
}

impl SessionState {
    /// Returns the canonical lowercase label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Recognizing => "recognizing",
            Self::Generating => "generating",
            Self::Synthesizing => "synthesizing",
            Self::Responding => "responding",
            Self::Interrupted => "interrupted",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    /// Whether the companion currently holds the conversational floor.
    ///
    /// Barge-in is only meaningful in these states.
    pub fn companion_speaking(self) -> bool {
        matches!(self, Self::Synthesizing | Self::Responding)
    }

    /// Whether a turn pipeline is running in this state.
    pub fn turn_in_flight(self) -> bool {
        matches!(
            self,
            Self::Generating | Self::Synthesizing | Self::Responding | Self::Interrupted
        )
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = ParseSessionStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "listening" => Ok(Self::Listening),
            "recognizing" => Ok(Self::Recognizing),
            "generating" => Ok(Self::Generating),
            "synthesizing" => Ok(Self::Synthesizing),
            "responding" => Ok(Self::Responding),
            "interrupted" => Ok(Self::Interrupted),
            "reconnecting" => Ok(Self::Reconnecting),
            "closed" => Ok(Self::Closed),
            _ => Err(ParseSessionStateError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown session state label.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown session state: {0}")]
pub struct ParseSessionStateError(pub String);
