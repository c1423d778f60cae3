use holo_link::LinkError;
use holo_types::{ParticipantId, SessionId, Tier};
use holo_voice::AdapterError;
use thiserror::Error;

/// Errors surfaced to callers of the session orchestrator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    #[error("{tier} tier quota exceeded: {limit}")]
    QuotaExceeded { tier: Tier, limit: String },

    #[error("participant {0} is not part of this session")]
    UnknownParticipant(ParticipantId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("adapter timed out: {0}")]
    AdapterTimeout(String),

    #[error("adapter failed: {0}")]
    AdapterFailure(String),

    #[error("device unreachable")]
    DeviceUnreachable,

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("turn store error: {0}")]
    Store(String),
}

impl From<AdapterError> for SessionError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Timeout { .. } => Self::AdapterTimeout(err.to_string()),
            other => Self::AdapterFailure(other.to_string()),
        }
    }
}
