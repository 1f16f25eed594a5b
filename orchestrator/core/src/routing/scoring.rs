//! Candidate scoring
//!
//! The Routing Engine ranks candidates through [`CandidateScorer`]. The
//! default [`WeightedScorer`] is a deterministic linear function; other
//! scorers (e.g. one backed by a model's judgement) plug in behind the same
//! trait without touching candidate construction or tie-breaking.

use std::time::Duration;

use serde::Serialize;

use super::config::ScoringWeights;
use crate::capability::{saturating_secs, ModelCapability, Tier};
use crate::registry::{Instance, InstanceId, Locality};

/// An (instance, model) pair eligible for a request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Candidate {
    /// Instance
    pub instance: InstanceId,
    /// Instance locality
    pub locality: Locality,
    /// Instance load estimate in [0, 1]
    pub load: f64,
    /// Whether the model is resident on the instance
    pub warm: bool,
    /// Model capability
    pub capability: ModelCapability,
}

impl Candidate {
    /// Candidate for `instance` serving `capability`
    #[must_use]
    pub fn new(instance: &Instance, capability: ModelCapability) -> Self {
        Self {
            instance: instance.id.clone(),
            locality: instance.locality,
            load: instance.load.clamp(0.0, 1.0),
            warm: instance.is_warm(&capability.model_id),
            capability,
        }
    }

    /// Model identifier
    #[must_use]
    pub fn model(&self) -> &str {
        &self.capability.model_id
    }

    /// Tier midpoint stretched by current load
    #[must_use]
    pub fn estimated_latency(&self) -> Duration {
        let secs = self.capability.latency.midpoint() * (1.0 + self.load);
        saturating_secs(secs)
    }
}

/// Request-side inputs to scoring
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoringContext {
    /// Tier the request asked for (or had inferred)
    pub tier: Option<Tier>,
    /// Latency budget
    pub budget: Option<Duration>,
}

/// Ranks candidates; higher is better
pub trait CandidateScorer: Send + Sync {
    /// Scorer name for rationales and logs
    fn name(&self) -> &'static str;

    /// Score one candidate
    ///
    /// Must be a pure function of its inputs; routing determinism depends on
    /// it.
    fn score(&self, candidate: &Candidate, ctx: &ScoringContext) -> f64;
}

/// Per-term contributions to a weighted score
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Locality bonus
    pub locality: f64,
    /// Warm-model bonus
    pub warm: f64,
    /// Load penalty (subtracted)
    pub load: f64,
    /// Latency penalty (subtracted)
    pub latency: f64,
}

impl ScoreBreakdown {
    /// Final score
    #[must_use]
    pub fn total(&self) -> f64 {
        self.locality + self.warm - self.load - self.latency
    }
}

/// Linear scorer over locality, load, latency fit and warm models
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WeightedScorer {
    weights: ScoringWeights,
}

impl WeightedScorer {
    /// Create a scorer
    #[must_use]
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    /// Weights in use
    #[must_use]
    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Term-by-term score
    #[must_use]
    pub fn breakdown(&self, candidate: &Candidate, ctx: &ScoringContext) -> ScoreBreakdown {
        let w = &self.weights;

        let locality = match candidate.locality {
            Locality::Local => {
                let tier = ctx.tier.unwrap_or(candidate.capability.tier);
                if tier == Tier::Fast {
                    w.locality_weight * w.fast_tier_locality_multiplier
                } else {
                    w.locality_weight
                }
            }
            Locality::Remote => 0.0,
        };

        let warm = if candidate.warm { w.warm_model_bonus } else { 0.0 };
        let load = w.load_weight * candidate.load;
        let latency = ctx.budget.map_or(0.0, |budget| {
            (candidate.capability.latency.midpoint() - budget.as_secs_f64()).abs()
                * w.latency_weight
        });

        ScoreBreakdown {
            locality,
            warm,
            load,
            latency,
        }
    }
}

impl CandidateScorer for WeightedScorer {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn score(&self, candidate: &Candidate, ctx: &ScoringContext) -> f64 {
        self.breakdown(candidate, ctx).total()
    }
}
