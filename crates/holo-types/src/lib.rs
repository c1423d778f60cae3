//! Shared types for the Holo conversational streaming platform.
//!
//! This crate provides the data model that flows between the pipeline
//! stages: session states, utterances, turns, synthesized audio segments,
//! animation cues, and the payloads multiplexed over a device link.
//!
//! No crate in the workspace depends on anything *except* `holo-types` for
//! cross-cutting type definitions. This keeps the dependency graph acyclic:
//! the voice adapters, the device link, and the session orchestrator only
//! ever meet through these types.

pub mod media;
pub mod profile;
pub mod state;
pub mod turn;

pub use media::{AnimationCue, AudioSegment, CueShape, DevicePayload};
pub use profile::{CompanionProfile, FallbackClip, Tier};
pub use state::{ParseSessionStateError, SessionState};
pub use turn::{AudioSpan, Turn, TurnCompletion, Utterance, UtteranceOrigin};

/// Unique identifier of a conversational session.
pub type SessionId = uuid::Uuid;

/// Unique identifier of a logical device link.
pub type LinkId = uuid::Uuid;

/// Identifier of a human participant (supplied by the account service).
pub type ParticipantId = String;

/// Identifier of a companion instance (supplied by the asset service).
pub type CompanionId = String;

/// Identifier of a physical rendering device.
pub type DeviceId = String;

/// Per-session monotonically increasing turn number, starting at 1.
pub type TurnId = u64;

/// Participant id used for system-initiated prompts.
pub const SYSTEM_PARTICIPANT: &str = "system";

/// Milliseconds since the Unix epoch, saturating to zero for clocks set
/// before 1970.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
