use thiserror::Error;

/// Which pipeline stage an adapter serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Recognition,
    Generation,
    Synthesis,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recognition => "recognition",
            Self::Generation => "generation",
            Self::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by an external engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine failed: {0}")]
    Failed(String),

    #[error("invalid engine input: {0}")]
    InvalidInput(String),
}

/// Errors surfaced by an adapter after its own recovery has been exhausted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("{stage} timed out after {after_ms} ms")]
    Timeout { stage: Stage, after_ms: u64 },

    #[error("{stage} failed: {reason}")]
    Failure { stage: Stage, reason: String },

    #[error("stream cancelled")]
    Cancelled,

    #[error("stream not started")]
    NotStarted,

    #[error("stream already closed")]
    Closed,
}

impl AdapterError {
    /// The stage that failed, for timeouts and failures.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Timeout { stage, .. } | Self::Failure { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
