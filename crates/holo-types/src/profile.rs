//! Entitlement tiers and companion profiles.
//!
//! Both are supplied by upstream collaborators (the account service and the
//! asset service) and only consumed here.

use crate::{AnimationCue, AudioSegment, CompanionId};
use serde::{Deserialize, Serialize};

/// Subscription tier of the account that owns a session.
///
/// Determines the quota limits applied by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Plus,
    Premium,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Plus => "plus",
            Self::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A short acknowledgment used when the pipeline must degrade.
///
/// `audio` and `cues` are pre-rendered by the asset service; when absent the
/// device receives a text-only fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackClip {
    pub text: String,
    #[serde(default)]
    pub audio: Option<AudioSegment>,
    #[serde(default)]
    pub cues: Vec<AnimationCue>,
}

impl FallbackClip {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio: None,
            cues: Vec::new(),
        }
    }
}

/// Voice and persona parameters for one companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionProfile {
    pub companion_id: CompanionId,
    /// Voice identifier passed to the synthesis engine.
    pub voice_id: String,
    /// Speech speed multiplier (1.0 is normal).
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// System prompt describing the companion's persona.
    #[serde(default)]
    pub persona: String,
    pub fallback: FallbackClip,
}

fn default_speed() -> f32 {
    1.0
}

impl CompanionProfile {
    /// A neutral profile for companions the asset service does not know.
    pub fn generic(companion_id: impl Into<CompanionId>) -> Self {
        Self {
            companion_id: companion_id.into(),
            voice_id: "default".to_string(),
            speed: default_speed(),
            persona: String::new(),
            fallback: FallbackClip::text_only("Mm-hm, give me a second."),
        }
    }
}
