//! Performance tiers and their latency envelopes

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest envelope bound accepted from configuration (one day)
pub const MAX_ENVELOPE_SECS: f64 = 86_400.0;

/// Seconds as a `Duration`, saturating
///
/// Negative and NaN inputs give zero; values too large to represent give
/// [`Duration::MAX`].
#[must_use]
pub fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

// ============================================================================
// Tier
// ============================================================================

/// Coarse performance/size classification of a model
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Small models, sub-second to a few seconds
    Fast,
    /// Mid-sized general purpose models
    Balanced,
    /// Large models for heavy reasoning or long documents
    Powerful,
}

impl Tier {
    /// All tiers, smallest first
    pub const ALL: [Tier; 3] = [Tier::Fast, Tier::Balanced, Tier::Powerful];

    /// Lowercase name used in configuration and logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Powerful => "powerful",
        }
    }

    /// Guess a tier from prompt length alone
    ///
    /// Short prompts go to fast models, medium prompts to balanced ones and
    /// anything longer to powerful ones. This is a size heuristic, not a
    /// judgement of the prompt's content.
    #[must_use]
    pub fn from_prompt_length(chars: usize) -> Self {
        if chars < 100 {
            Self::Fast
        } else if chars < 500 {
            Self::Balanced
        } else {
            Self::Powerful
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "powerful" => Ok(Self::Powerful),
            other => Err(format!(
                "unknown tier '{other}' (expected fast, balanced or powerful)"
            )),
        }
    }
}

// ============================================================================
// Size Boundaries
// ============================================================================

/// Size thresholds (GB) separating the tiers
///
/// `fast` is strictly below `fast_max_gb`, `balanced` runs up to and
/// including `balanced_max_gb`, and `powerful` is everything larger.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierBoundaries {
    /// Upper bound (exclusive) for the fast tier
    pub fast_max_gb: f64,
    /// Upper bound (inclusive) for the balanced tier
    pub balanced_max_gb: f64,
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self {
            fast_max_gb: 3.0,
            balanced_max_gb: 10.0,
        }
    }
}

impl TierBoundaries {
    /// Classify a model by its size
    #[must_use]
    pub fn tier_for(&self, size_gb: f64) -> Tier {
        if size_gb < self.fast_max_gb {
            Tier::Fast
        } else if size_gb <= self.balanced_max_gb {
            Tier::Balanced
        } else {
            Tier::Powerful
        }
    }
}

// ============================================================================
// Latency Envelopes
// ============================================================================

/// Expected latency range for one request on a model of a given tier
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatencyEnvelope {
    /// Best case, in seconds
    pub min_secs: f64,
    /// Worst acceptable case, in seconds
    pub max_secs: f64,
}

impl LatencyEnvelope {
    /// Create an envelope, swapping the bounds if given in the wrong order
    #[must_use]
    pub fn new(min_secs: f64, max_secs: f64) -> Self {
        if min_secs <= max_secs {
            Self { min_secs, max_secs }
        } else {
            Self {
                min_secs: max_secs,
                max_secs: min_secs,
            }
        }
    }

    /// Whether both bounds are finite, `0 <= min <= max` and `max > 0`
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min_secs.is_finite()
            && self.max_secs.is_finite()
            && self.min_secs >= 0.0
            && self.min_secs <= self.max_secs
            && self.max_secs > 0.0
            && self.max_secs <= MAX_ENVELOPE_SECS
    }

    /// Midpoint of the envelope in seconds
    #[must_use]
    pub fn midpoint(&self) -> f64 {
        (self.min_secs + self.max_secs) / 2.0
    }

    /// Minimum as a `Duration`
    #[must_use]
    pub fn min(&self) -> Duration {
        saturating_secs(self.min_secs)
    }

    /// Where `observed_secs` falls within the envelope, clamped to [0, 1]
    ///
    /// Used as the load sample fed back after a successful dispatch.
    #[must_use]
    pub fn position_of(&self, observed_secs: f64) -> f64 {
        let span = self.max_secs - self.min_secs;
        if span <= f64::EPSILON {
            return if observed_secs > self.max_secs { 1.0 } else { 0.0 };
        }
        ((observed_secs - self.min_secs) / span).clamp(0.0, 1.0)
    }
}

/// Latency envelope per tier
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierLatencies {
    /// Fast tier envelope
    pub fast: LatencyEnvelope,
    /// Balanced tier envelope
    pub balanced: LatencyEnvelope,
    /// Powerful tier envelope
    pub powerful: LatencyEnvelope,
}

impl Default for TierLatencies {
    fn default() -> Self {
        Self {
            fast: LatencyEnvelope::new(0.5, 5.0),
            balanced: LatencyEnvelope::new(3.0, 30.0),
            powerful: LatencyEnvelope::new(10.0, 120.0),
        }
    }
}

impl TierLatencies {
    /// Envelope for a tier
    #[must_use]
    pub fn envelope(&self, tier: Tier) -> LatencyEnvelope {
        match tier {
            Tier::Fast => self.fast,
            Tier::Balanced => self.balanced,
            Tier::Powerful => self.powerful,
        }
    }
}
