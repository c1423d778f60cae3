//! Pipeline configuration.
//!
//! Every threshold here is required: there are no built-in deadlines,
//! confidence levels or grace periods. Missing keys fail deserialization
//! and [`PipelineConfig::validate`] rejects inconsistent values.

use holo_types::Tier;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid pipeline configuration: {0}")]
pub struct InvalidConfig(pub String);

/// Latency budget, measured from end of utterance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LatencyConfig {
    /// No response text by then: cancel generation and play the fallback clip.
    pub generation_soft_deadline_ms: u64,
    /// Generation still running by then: truncate the response.
    pub generation_total_deadline_ms: u64,
    /// No audio this long after the first response text: fall back.
    pub synthesis_soft_deadline_ms: u64,
    /// Nothing delivered by then: fall back regardless of stage.
    pub hard_deadline_ms: u64,
    /// Reporting targets for the rolling latency statistics.
    pub target_mean_ms: u64,
    pub target_p95_ms: u64,
}

/// How the context window makes room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict one turn at a time, oldest first.
    DropOldest,
    /// Evict the oldest half of the window at once.
    DropOldestHalf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContextConfig {
    pub max_turns: usize,
    /// Upper bound on the characters of input plus response kept.
    pub max_chars: usize,
    pub eviction: EvictionPolicy,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TurnConfig {
    /// Recognition confidence at which an utterance is likely final.
    pub likely_final_confidence: f32,
    /// Minimum speech before an utterance can be likely final.
    pub likely_final_min_ms: u64,
    /// Crossings this close together are arbitrated by speech start time.
    pub arbitration_window_ms: u64,
    /// Finalized utterances waiting for the floor.
    pub pending_capacity: usize,
    /// Energy (RMS, 0..1) a participant must sustain to barge in.
    pub barge_in_energy: f32,
    /// How long the energy must be sustained.
    pub barge_in_min_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IngressConfig {
    pub sample_rate: u32,
    /// Frames are held this long to put them back into capture order.
    pub reorder_window_ms: u64,
    /// Energy (RMS, 0..1) that counts as speech.
    pub speech_energy: f32,
    /// Silence that ends an utterance.
    pub end_of_speech_ms: u64,
    /// Longest single utterance before it is cut.
    pub max_utterance_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinkSettings {
    pub grace_period_ms: u64,
    pub unacked_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdapterSettings {
    pub retry_backoff_ms: u64,
    /// Longest wait for one generation or synthesis chunk.
    pub chunk_timeout_ms: u64,
    /// Longest wait for recognition to finalize after speech ended.
    pub recognition_final_timeout_ms: u64,
    /// Bound on tearing down a cancelled engine request.
    pub cleanup_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionSettings {
    pub idle_timeout_ms: u64,
    /// Bound on waiting for stages to acknowledge a cancellation.
    pub cancel_ack_timeout_ms: u64,
    /// Capacity of the bounded queues between stages.
    pub stage_queue_capacity: usize,
    /// Latency samples kept per session for mean and p95.
    pub latency_samples: usize,
    /// State transitions kept per session.
    pub history_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QuotaLimits {
    pub max_concurrent_sessions: usize,
    pub max_turns_per_session: u64,
    pub max_response_chars: usize,
}

/// The `[pipeline]` configuration section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PipelineConfig {
    pub latency: LatencyConfig,
    pub context: ContextConfig,
    pub turn: TurnConfig,
    pub ingress: IngressConfig,
    pub link: LinkSettings,
    pub adapters: AdapterSettings,
    pub session: SessionSettings,
    pub quotas: HashMap<Tier, QuotaLimits>,
}

impl PipelineConfig {
    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        let l = &self.latency;
        if l.generation_soft_deadline_ms == 0 || l.hard_deadline_ms == 0 {
            return Err(InvalidConfig("latency deadlines must be positive".into()));
        }
        if l.generation_soft_deadline_ms >= l.hard_deadline_ms
            || l.synthesis_soft_deadline_ms >= l.hard_deadline_ms
        {
            return Err(InvalidConfig(
                "soft deadlines must be shorter than the hard deadline".into(),
            ));
        }
        if l.generation_total_deadline_ms < l.generation_soft_deadline_ms {
            return Err(InvalidConfig(
                "generation total deadline must not precede its soft deadline".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.turn.likely_final_confidence) {
            return Err(InvalidConfig("likely_final_confidence must be within [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.turn.barge_in_energy)
            || !(0.0..=1.0).contains(&self.ingress.speech_energy)
        {
            return Err(InvalidConfig("energy thresholds must be within [0, 1]".into()));
        }
        if self.turn.barge_in_min_ms == 0 {
            return Err(InvalidConfig("turn.barge_in_min_ms must be positive".into()));
        }
        if self.context.max_turns == 0 {
            return Err(InvalidConfig("context.max_turns must be at least 1".into()));
        }
        if self.ingress.sample_rate == 0 {
            return Err(InvalidConfig("ingress.sample_rate must be positive".into()));
        }
        if self.link.unacked_capacity == 0 || self.session.stage_queue_capacity == 0 {
            return Err(InvalidConfig("queue capacities must be at least 1".into()));
        }
        if !self.quotas.contains_key(&Tier::Free) {
            return Err(InvalidConfig("quotas must define the free tier".into()));
        }
        Ok(())
    }

    /// Limits for `tier`, falling back to the free tier.
    pub fn quota(&self, tier: Tier) -> QuotaLimits {
        self.quotas
            .get(&tier)
            .or_else(|| self.quotas.get(&Tier::Free))
            .copied()
            .unwrap_or(QuotaLimits {
                max_concurrent_sessions: 1,
                max_turns_per_session: 0,
                max_response_chars: 0,
            })
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.link.grace_period_ms)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A consistent configuration for unit and integration tests.
    pub fn pipeline_config() -> PipelineConfig {
        toml::from_str(TEST_PIPELINE).expect("test pipeline config parses")
    }

    pub const TEST_PIPELINE: &str = r#"
[latency]
generation_soft_deadline_ms = 800
generation_total_deadline_ms = 4000
synthesis_soft_deadline_ms = 700
hard_deadline_ms = 2000
target_mean_ms = 1200
target_p95_ms = 2000

[context]
max_turns = 8
max_chars = 4000
eviction = "drop_oldest"

[turn]
likely_final_confidence = 0.6
likely_final_min_ms = 300
arbitration_window_ms = 100
pending_capacity = 4
barge_in_energy = 0.2
barge_in_min_ms = 200

[ingress]
sample_rate = 16000
reorder_window_ms = 0
speech_energy = 0.05
end_of_speech_ms = 300
max_utterance_ms = 15000

[link]
grace_period_ms = 20000
unacked_capacity = 256

[adapters]
retry_backoff_ms = 50
chunk_timeout_ms = 1500
recognition_final_timeout_ms = 2000
cleanup_timeout_ms = 100

[session]
idle_timeout_ms = 600000
cancel_ack_timeout_ms = 250
stage_queue_capacity = 16
latency_samples = 64
history_len = 64

[quotas.free]
max_concurrent_sessions = 2
max_turns_per_session = 50
max_response_chars = 400

[quotas.premium]
max_concurrent_sessions = 10
max_turns_per_session = 1000
max_response_chars = 2000
"#;

    #[test]
    fn test_config_is_valid() {
        pipeline_config().validate().unwrap();
    }

    #[test]
    fn missing_section_fails_to_parse() {
        let without_latency = TEST_PIPELINE.replace("[latency]", "[latency_unused]");
        assert!(toml::from_str::<PipelineConfig>(&without_latency).is_err());
    }

    #[test]
    fn soft_deadline_past_hard_is_rejected() {
        let mut config = pipeline_config();
        config.latency.generation_soft_deadline_ms = 2500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_barge_in_minimum_is_rejected() {
        let mut config = pipeline_config();
        config.turn.barge_in_min_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.0.contains("barge_in_min_ms"), "{err}");
    }

    #[test]
    fn unknown_tier_uses_free_limits() {
        let config = pipeline_config();
        assert_eq!(config.quota(Tier::Plus), config.quota(Tier::Free));
        assert_eq!(config.quota(Tier::Premium).max_turns_per_session, 1000);
    }
}
