//! Background tasks for the Holo server.
//!
//! Includes:
//! - Closing sessions that have gone idle.

use holo_session::Orchestrator;
use tokio::time::{sleep, Duration};

/// Starts the idle-session sweeper.
///
/// This task runs indefinitely, periodically closing sessions that received
/// no audio, text or heartbeat for longer than `idle_timeout_ms`.
pub async fn start_idle_sweeper(orchestrator: Orchestrator, idle_timeout_ms: u64) {
    if idle_timeout_ms == 0 {
        tracing::warn!("idle session sweeper disabled (idle_timeout_ms=0)");
        return;
    }

    // Check every 60 seconds or timeout/2, whichever is smaller (but min 1s)
    let interval_seconds = (idle_timeout_ms / 2_000).clamp(1, 60);
    let interval = Duration::from_secs(interval_seconds);

    tracing::info!(idle_timeout_ms, interval_seconds, "starting idle session sweeper");

    loop {
        sleep(interval).await;

        let closed = orchestrator.sweep_idle().await;
        if !closed.is_empty() {
            tracing::info!(count = closed.len(), "closed idle sessions");
        }
    }
}
