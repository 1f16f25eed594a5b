//! Routing configuration

/// Weights for the default scorer
///
/// `score = locality_bonus + warm_bonus - load_penalty - latency_penalty`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoringWeights {
    /// Bonus for `local` instances
    pub locality_weight: f64,
    /// Multiplier applied to the locality bonus for fast-tier requests
    pub fast_tier_locality_multiplier: f64,
    /// Penalty per unit of instance load (load is in [0, 1])
    pub load_weight: f64,
    /// Penalty per second between the tier midpoint and the latency budget
    pub latency_weight: f64,
    /// Bonus when the model is already resident on the instance
    pub warm_model_bonus: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            locality_weight: 0.5,
            fast_tier_locality_multiplier: 2.0,
            load_weight: 1.0,
            latency_weight: 0.01,
            warm_model_bonus: 0.1,
        }
    }
}

/// Routing Engine configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingConfig {
    /// Scorer weights
    pub weights: ScoringWeights,
    /// Guess a tier from prompt length when the request names neither model
    /// nor tier
    pub infer_tier_from_prompt: bool,
    /// Runner-up candidates listed in the rationale
    pub rationale_top_n: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            infer_tier_from_prompt: false,
            rationale_top_n: 3,
        }
    }
}
