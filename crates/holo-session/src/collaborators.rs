//! Upstream services the orchestrator consumes: entitlements and companion
//! profiles.

use async_trait::async_trait;
use holo_types::{CompanionProfile, ParticipantId, Tier};
use std::collections::HashMap;

/// Account service view: which tier a participant is entitled to.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    async fn tier(&self, participant: &str) -> Tier;
}

/// Asset service view: voice, persona and fallback for a companion.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn profile(&self, companion_id: &str) -> CompanionProfile;
}

/// Entitlements from a fixed table; unknown participants get `default_tier`.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    tiers: HashMap<ParticipantId, Tier>,
    default_tier: Tier,
}

impl StaticEntitlements {
    pub fn new(tiers: HashMap<ParticipantId, Tier>, default_tier: Tier) -> Self {
        Self {
            tiers,
            default_tier,
        }
    }
}

#[async_trait]
impl EntitlementSource for StaticEntitlements {
    async fn tier(&self, participant: &str) -> Tier {
        self.tiers
            .get(participant)
            .copied()
            .unwrap_or(self.default_tier)
    }
}

/// Profiles from a fixed table; unknown companions get a generic profile.
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles {
    profiles: HashMap<String, CompanionProfile>,
}

impl StaticProfiles {
    pub fn new(profiles: impl IntoIterator<Item = CompanionProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.companion_id.clone(), p))
                .collect(),
        }
    }
}

#[async_trait]
impl ProfileSource for StaticProfiles {
    async fn profile(&self, companion_id: &str) -> CompanionProfile {
        match self.profiles.get(companion_id) {
            Some(profile) => profile.clone(),
            None => {
                tracing::debug!(companion_id, "no profile configured, using generic");
                CompanionProfile::generic(companion_id)
            }
        }
    }
}
