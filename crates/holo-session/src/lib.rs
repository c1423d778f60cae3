//! Session orchestration for the Holo streaming pipeline.
//!
//! One session is one conversation between a set of participants and a
//! companion. Each runs as its own task that owns the session state machine,
//! the audio ingress buffer, the turn coordinator and the context window.
//! A turn runs as a pipeline of concurrent stages (generation, synthesis,
//! delivery) joined by bounded queues, so synthesis of one chunk overlaps
//! generation of the next.
//!
//! [`Orchestrator`] is the registry callers use: it starts and ends
//! sessions, routes audio and text to them, binds device links, enforces
//! per-tier quotas, and sweeps idle sessions.

pub mod collaborators;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod emitter;
pub mod error;
pub mod ingress;
pub mod orchestrator;
mod pipeline;
mod recognition;
mod session;
pub mod stats;
pub mod store;

pub use collaborators::{EntitlementSource, ProfileSource, StaticEntitlements, StaticProfiles};
pub use config::{
    AdapterSettings, ContextConfig, EvictionPolicy, IngressConfig, InvalidConfig, LatencyConfig,
    LinkSettings, PipelineConfig, QuotaLimits, SessionSettings, TurnConfig,
};
pub use error::SessionError;
pub use orchestrator::{Collaborators, DeviceAttachment, Orchestrator};
pub use pipeline::Engines;
pub use session::{SessionSnapshot, StateChange, TurnCounts};
pub use stats::LatencySummary;
pub use store::{MemoryTurnStore, SqliteTurnStore, TurnStore};
