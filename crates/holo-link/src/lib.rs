//! Resumable device links.
//!
//! A device link is one logical channel from a session to a rendering
//! device. Outbound audio and animation cues are multiplexed on it with a
//! per-link sequence number that keeps increasing across transport
//! connections. Every frame stays in a bounded unacked queue until the
//! device acknowledges it, so a device that drops and reconnects with its
//! last acknowledged sequence number gets exactly the frames after that
//! point: nothing it already played, nothing skipped.
//!
//! A link that stays disconnected for longer than the grace period drops
//! its pending frames and reports [`LinkEvent::GraceExpired`]; the owning
//! session abandons the turn in flight.

mod error;
mod links;
pub mod protocol;

pub use error::LinkError;
pub use links::{DeviceLinks, LinkConfig, LinkConnection, LinkEvent, LinkStatus};
pub use protocol::{InboundMessage, OutboundFrame};
