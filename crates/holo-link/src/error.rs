use holo_types::LinkId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("device link not found: {0}")]
    LinkNotFound(LinkId),

    #[error("invalid reconnect token")]
    InvalidToken,

    /// The device asked to resume from a point the link cannot serve.
    #[error("invalid resume point {requested}: acknowledged {acked}, latest {latest}")]
    InvalidResumePoint { requested: u64, acked: u64, latest: u64 },

    #[error("device link closed")]
    Closed,
}
