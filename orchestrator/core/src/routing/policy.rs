//! Routing policy
//!
//! Candidate construction, infeasibility reasons and the greedy single-pass
//! selection over one registry snapshot.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use thiserror::Error;

use super::config::RoutingConfig;
use super::scoring::{Candidate, CandidateScorer, ScoringContext, WeightedScorer};
use crate::capability::{CapabilityModel, ModelCapability, Tier};
use crate::metrics::OrchestratorMetrics;
use crate::registry::{Instance, InstanceId, Locality, RegistrySnapshot};

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn serialize_opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

// ============================================================================
// Routing Request
// ============================================================================

/// One inbound inference request, as routing sees it
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoutingRequest {
    /// Unique request ID
    pub request_id: String,
    /// Prompt text; only its size matters to routing
    pub prompt: String,
    /// Explicitly requested model
    pub model: Option<String>,
    /// Desired performance tier
    pub tier: Option<Tier>,
    /// Maximum acceptable latency
    #[serde(serialize_with = "serialize_opt_secs")]
    pub max_latency: Option<Duration>,
    /// Task tags the model must carry (any of them)
    pub required_tags: BTreeSet<String>,
    /// Backend generation options, passed through on dispatch
    #[serde(skip)]
    pub options: Option<serde_json::Value>,
}

impl RoutingRequest {
    /// A request with no constraints
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            model: None,
            tier: None,
            max_latency: None,
            required_tags: BTreeSet::new(),
            options: None,
        }
    }

    /// Require a specific model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Require a tier
    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Set a latency budget
    #[must_use]
    pub fn with_max_latency(mut self, budget: Duration) -> Self {
        self.max_latency = Some(budget);
        self
    }

    /// Require a task tag
    #[must_use]
    pub fn with_required_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.insert(tag.into());
        self
    }

    /// Require any of several task tags
    #[must_use]
    pub fn with_required_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Attach backend generation options
    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Tier used for routing
    ///
    /// The requested tier, or with `infer` set and no explicit model, a
    /// guess from prompt length.
    #[must_use]
    pub fn effective_tier(&self, infer: bool) -> Option<Tier> {
        self.tier.or_else(|| {
            (infer && self.model.is_none())
                .then(|| Tier::from_prompt_length(self.prompt.chars().count()))
        })
    }

    /// Human-readable summary of the constraints
    #[must_use]
    pub fn describe_requirement(&self, tier: Option<Tier>) -> String {
        let mut parts = Vec::new();
        if let Some(ref model) = self.model {
            parts.push(format!("model={model}"));
        }
        if let Some(tier) = tier {
            parts.push(format!("tier={tier}"));
        }
        if !self.required_tags.is_empty() {
            let tags: Vec<&str> = self.required_tags.iter().map(String::as_str).collect();
            parts.push(format!("tags=[{}]", tags.join(",")));
        }
        if parts.is_empty() {
            "any model".to_string()
        } else {
            parts.join(", ")
        }
    }
}

// ============================================================================
// Routing Decision
// ============================================================================

/// A scored candidate, for rationales
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoredCandidate {
    /// Instance
    pub instance: InstanceId,
    /// Model
    pub model: String,
    /// Score
    pub score: f64,
    /// Instance load at decision time
    pub load: f64,
}

/// A candidate dropped during construction, and why
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Instance
    pub instance: InstanceId,
    /// Model
    pub model: String,
    /// Why it was dropped
    pub reason: String,
}

/// Where to send a request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoutingDecision {
    /// Request this decision is for
    pub request_id: String,
    /// Selected instance
    pub instance: InstanceId,
    /// Its locality
    pub locality: Locality,
    /// Selected model
    pub model: String,
    /// The model's tier
    pub tier: Tier,
    /// Tier midpoint adjusted by instance load
    #[serde(serialize_with = "serialize_secs")]
    pub estimated_latency: Duration,
    /// Winning score
    pub score: f64,
    /// Next-best candidates, best first
    pub runners_up: Vec<ScoredCandidate>,
    /// Candidates dropped before scoring
    pub rejected: Vec<Rejection>,
    /// Human-readable explanation
    pub rationale: String,
    /// Registry version the decision was made against
    pub snapshot_version: u64,
}

// ============================================================================
// Infeasibility
// ============================================================================

/// Why no decision could be made
#[derive(Clone, Debug, Error, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Infeasibility {
    /// No model anywhere in the fleet satisfies the request
    #[error("no capable model for {requirement}")]
    NoCapableModel {
        /// What was asked for
        requirement: String,
        /// Pairs dropped and why
        rejected: Vec<Rejection>,
    },

    /// Satisfying models exist, but only on instances that cannot be used
    #[error("no healthy instance serves {}", .models.join(", "))]
    NoHealthyInstance {
        /// Models that would satisfy the request
        models: Vec<String>,
        /// Pairs dropped and why
        rejected: Vec<Rejection>,
    },

    /// Every capable candidate is slower than the latency budget
    #[error(
        "latency budget {budget_secs:.1}s is below the fastest candidate minimum {minimum_secs:.1}s"
    )]
    BudgetExceeded {
        /// Budget given
        budget_secs: f64,
        /// Smallest minimum latency among capable candidates
        minimum_secs: f64,
    },
}

impl Infeasibility {
    /// Short machine-readable name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCapableModel { .. } => "no_capable_model",
            Self::NoHealthyInstance { .. } => "no_healthy_instance",
            Self::BudgetExceeded { .. } => "budget_exceeded",
        }
    }

    fn budget(budget: Duration, minimum: Duration) -> Self {
        Self::BudgetExceeded {
            budget_secs: budget.as_secs_f64(),
            minimum_secs: minimum.as_secs_f64(),
        }
    }
}

// ============================================================================
// Routing Engine
// ============================================================================

/// Selects an (instance, model) pair for a request
pub struct RoutingEngine {
    config: RoutingConfig,
    scorer: Arc<dyn CandidateScorer>,
    metrics: Arc<OrchestratorMetrics>,
}

impl RoutingEngine {
    /// Create an engine with the weighted scorer
    pub fn new(config: RoutingConfig, metrics: Arc<OrchestratorMetrics>) -> Self {
        let scorer = Arc::new(WeightedScorer::new(config.weights));
        Self {
            config,
            scorer,
            metrics,
        }
    }

    /// Replace the scorer
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn CandidateScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Route a request against a snapshot
    ///
    /// Instances in `excluded` are treated as unusable (failed attempts of
    /// this request). Records routing metrics.
    pub fn route(
        &self,
        request: &RoutingRequest,
        snapshot: &RegistrySnapshot,
        capabilities: &CapabilityModel,
        excluded: &BTreeSet<InstanceId>,
    ) -> Result<RoutingDecision, Infeasibility> {
        let start = Instant::now();
        let result = self.evaluate(request, snapshot, capabilities, excluded);
        match &result {
            Ok(decision) => {
                self.metrics
                    .record_decision(start.elapsed(), decision.rejected.len());
                tracing::debug!(
                    request_id = %request.request_id,
                    instance = %decision.instance,
                    model = %decision.model,
                    score = decision.score,
                    "{}",
                    decision.rationale
                );
            }
            Err(reason) => {
                self.metrics.record_infeasible(reason, start.elapsed());
                tracing::debug!(
                    request_id = %request.request_id,
                    reason = reason.kind(),
                    "Routing infeasible: {reason}"
                );
            }
        }
        result
    }

    /// Same decision as [`RoutingEngine::route`] with no metrics recorded
    pub fn evaluate(
        &self,
        request: &RoutingRequest,
        snapshot: &RegistrySnapshot,
        capabilities: &CapabilityModel,
        excluded: &BTreeSet<InstanceId>,
    ) -> Result<RoutingDecision, Infeasibility> {
        let tier = request.effective_tier(self.config.infer_tier_from_prompt);
        let budget = request.max_latency;

        // A tier whose floor is above the budget can never fit
        if let (Some(tier), Some(budget)) = (tier, budget) {
            let minimum = capabilities.envelope(tier).min();
            if minimum > budget {
                return Err(Infeasibility::budget(budget, minimum));
            }
        }

        let mut rejected = Vec::new();

        // 1. Capability: every pair in the fleet that satisfies the request
        let mut capable: Vec<(&Instance, ModelCapability)> = Vec::new();
        for instance in snapshot.iter() {
            for model in &instance.models {
                if request.model.as_ref().is_some_and(|m| m != model) {
                    continue;
                }
                let capability = capabilities.classify(model, None);
                if let Some(tier) = tier {
                    if capability.tier != tier {
                        let reason = format!("tier {} is not {tier}", capability.tier);
                        reject(&mut rejected, instance, model, reason);
                        continue;
                    }
                }
                if !capability.supports(&request.required_tags) {
                    reject(&mut rejected, instance, model, "missing required tags".to_string());
                    continue;
                }
                capable.push((instance, capability));
            }
        }
        if capable.is_empty() {
            return Err(Infeasibility::NoCapableModel {
                requirement: request.describe_requirement(tier),
                rejected,
            });
        }

        // 2. Health
        let mut candidates = Vec::new();
        let mut capable_models = BTreeSet::new();
        for (instance, capability) in capable {
            capable_models.insert(capability.model_id.clone());
            if !instance.is_healthy() {
                let reason = format!("instance {}", instance.health);
                reject(&mut rejected, instance, &capability.model_id, reason);
            } else if excluded.contains(&instance.id) {
                let reason = "instance failed earlier attempt".to_string();
                reject(&mut rejected, instance, &capability.model_id, reason);
            } else {
                candidates.push(Candidate::new(instance, capability));
            }
        }
        if candidates.is_empty() {
            return Err(Infeasibility::NoHealthyInstance {
                models: capable_models.into_iter().collect(),
                rejected,
            });
        }

        // 3. Budget
        if let Some(budget) = budget {
            let mut fastest: Option<Duration> = None;
            candidates.retain(|c| {
                let minimum = c.capability.latency.min();
                if minimum <= budget {
                    return true;
                }
                fastest = Some(fastest.map_or(minimum, |f| f.min(minimum)));
                tracing::debug!(
                    instance = %c.instance,
                    model = c.model(),
                    reason = "minimum latency exceeds budget",
                    "Routing rejected candidate"
                );
                rejected.push(Rejection {
                    instance: c.instance.clone(),
                    model: c.model().to_string(),
                    reason: format!("minimum latency {:.1}s exceeds budget", minimum.as_secs_f64()),
                });
                false
            });
            if candidates.is_empty() {
                return Err(Infeasibility::budget(budget, fastest.unwrap_or(budget)));
            }
        }

        // 4. Score and rank
        let ctx = ScoringContext { tier, budget };
        let mut scored: Vec<(f64, Candidate)> = candidates
            .into_iter()
            .map(|c| (self.scorer.score(&c, &ctx), c))
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.total_cmp(sa)
                .then_with(|| a.load.total_cmp(&b.load))
                .then_with(|| a.instance.cmp(&b.instance))
                .then_with(|| a.model().cmp(b.model()))
        });

        let mut ranked = scored.into_iter();
        let Some((score, winner)) = ranked.next() else {
            return Err(Infeasibility::NoHealthyInstance {
                models: capable_models.into_iter().collect(),
                rejected,
            });
        };
        let runners_up: Vec<ScoredCandidate> = ranked
            .take(self.config.rationale_top_n)
            .map(|(score, c)| ScoredCandidate {
                model: c.model().to_string(),
                instance: c.instance,
                score,
                load: c.load,
            })
            .collect();

        let rationale = self.rationale(score, &winner, &runners_up, &rejected);
        Ok(RoutingDecision {
            request_id: request.request_id.clone(),
            estimated_latency: winner.estimated_latency(),
            instance: winner.instance,
            locality: winner.locality,
            tier: winner.capability.tier,
            model: winner.capability.model_id,
            score,
            runners_up,
            rejected,
            rationale,
            snapshot_version: snapshot.version(),
        })
    }

    fn rationale(
        &self,
        score: f64,
        winner: &Candidate,
        runners_up: &[ScoredCandidate],
        rejected: &[Rejection],
    ) -> String {
        let mut out = format!(
            "selected {}@{} (score {:.3}, load {:.2}, {}, {} tier{}) by {} scorer",
            winner.model(),
            winner.instance,
            score,
            winner.load,
            winner.locality,
            winner.capability.tier,
            if winner.warm { ", warm" } else { "" },
            self.scorer.name(),
        );
        if !runners_up.is_empty() {
            out.push_str("; runners-up:");
            for c in runners_up {
                let _ = write!(out, " {}@{} {:.3}", c.model, c.instance, c.score);
            }
        }
        if !rejected.is_empty() {
            out.push_str("; rejected:");
            for r in rejected.iter().take(self.config.rationale_top_n) {
                let _ = write!(out, " {}@{} ({})", r.model, r.instance, r.reason);
            }
            if rejected.len() > self.config.rationale_top_n {
                let _ = write!(out, " and {} more", rejected.len() - self.config.rationale_top_n);
            }
        }
        out
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("config", &self.config)
            .field("scorer", &self.scorer.name())
            .finish()
    }
}

fn reject(rejected: &mut Vec<Rejection>, instance: &Instance, model: &str, reason: String) {
    tracing::debug!(
        instance = %instance.id,
        model,
        reason = %reason,
        "Routing rejected candidate"
    );
    rejected.push(Rejection {
        instance: instance.id.clone(),
        model: model.to_string(),
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HealthState;
    use pretty_assertions::assert_eq;

    fn instance(host: &str, locality: Locality, load: f64, models: &[&str]) -> Instance {
        let mut i = Instance::new(InstanceId::new(host, 11434), locality, 1);
        i.health = HealthState::Healthy;
        i.load = load;
        i.models = models.iter().map(|m| (*m).to_string()).collect();
        i
    }

    fn engine() -> RoutingEngine {
        RoutingEngine::new(RoutingConfig::default(), Arc::new(OrchestratorMetrics::new()))
    }

    fn route(
        engine: &RoutingEngine,
        request: &RoutingRequest,
        instances: Vec<Instance>,
    ) -> Result<RoutingDecision, Infeasibility> {
        let snapshot = RegistrySnapshot::new(1, instances);
        engine.route(request, &snapshot, &CapabilityModel::with_defaults(), &BTreeSet::new())
    }

    #[test]
    fn test_effective_tier() {
        let short = RoutingRequest::new("hi");
        assert_eq!(short.effective_tier(false), None);
        assert_eq!(short.effective_tier(true), Some(Tier::Fast));
        assert_eq!(
            RoutingRequest::new("x".repeat(600)).effective_tier(true),
            Some(Tier::Powerful)
        );
        // Explicit model disables inference
        assert_eq!(short.clone().with_model("phi4").effective_tier(true), None);
        assert_eq!(
            short.with_tier(Tier::Balanced).effective_tier(true),
            Some(Tier::Balanced)
        );
    }

    #[test]
    fn test_local_fast_wins_over_idle_remote() {
        let request = RoutingRequest::new("hi").with_tier(Tier::Fast);
        let decision = route(
            &engine(),
            &request,
            vec![
                instance("a", Locality::Local, 0.1, &["phi4"]),
                instance("b", Locality::Remote, 0.0, &["phi4"]),
            ],
        )
        .unwrap();
        assert_eq!(decision.instance.host, "a");
        assert_eq!(decision.model, "phi4");
        assert_eq!(decision.runners_up.len(), 1);
        assert!(decision.rationale.contains("selected phi4@a:11434"));
    }

    #[test]
    fn test_explicit_model() {
        let request = RoutingRequest::new("hi").with_model("llama3.1:8b");
        let decision = route(
            &engine(),
            &request,
            vec![
                instance("a", Locality::Local, 0.0, &["phi4"]),
                instance("b", Locality::Remote, 0.9, &["llama3.1:8b"]),
            ],
        )
        .unwrap();
        assert_eq!(decision.model, "llama3.1:8b");
        assert_eq!(decision.instance.host, "b");
    }

    #[test]
    fn test_no_capable_model() {
        let request = RoutingRequest::new("prove it").with_required_tag("reasoning");
        let err = route(
            &engine(),
            &request,
            vec![instance("a", Locality::Local, 0.0, &["phi4", "qwen2.5:7b"])],
        )
        .unwrap_err();
        match err {
            Infeasibility::NoCapableModel {
                requirement,
                rejected,
            } => {
                assert_eq!(requirement, "tags=[reasoning]");
                assert_eq!(rejected.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_no_healthy_instance() {
        let mut down = instance("a", Locality::Local, 0.0, &["gpt-oss:20b"]);
        down.health = HealthState::Unreachable;
        let request = RoutingRequest::new("prove it").with_required_tag("reasoning");
        let err = route(&engine(), &request, vec![down]).unwrap_err();
        assert_eq!(err.kind(), "no_healthy_instance");
        assert!(err.to_string().contains("gpt-oss:20b"));
    }

    #[test]
    fn test_tier_floor_above_budget() {
        let request = RoutingRequest::new("essay")
            .with_tier(Tier::Powerful)
            .with_max_latency(Duration::from_secs(5));
        let err = route(
            &engine(),
            &request,
            vec![instance("a", Locality::Local, 0.0, &["gpt-oss:20b"])],
        )
        .unwrap_err();
        assert_eq!(
            err,
            Infeasibility::BudgetExceeded {
                budget_secs: 5.0,
                minimum_secs: 10.0
            }
        );
    }

    #[test]
    fn test_budget_filters_slow_candidates() {
        let request = RoutingRequest::new("hi").with_max_latency(Duration::from_secs(5));
        let decision = route(
            &engine(),
            &request,
            vec![
                instance("a", Locality::Local, 0.0, &["gpt-oss:20b"]),
                instance("b", Locality::Remote, 0.5, &["qwen2.5:7b"]),
            ],
        )
        .unwrap();
        assert_eq!(decision.model, "qwen2.5:7b");
        assert!(decision.rejected.iter().any(|r| r.model == "gpt-oss:20b"));

        let request = RoutingRequest::new("hi").with_max_latency(Duration::from_secs(1));
        let err = route(
            &engine(),
            &request,
            vec![instance("a", Locality::Local, 0.0, &["gpt-oss:20b", "qwen2.5:7b"])],
        )
        .unwrap_err();
        assert_eq!(
            err,
            Infeasibility::BudgetExceeded {
                budget_secs: 1.0,
                minimum_secs: 3.0
            }
        );
    }

    #[test]
    fn test_excluded_instance_skipped() {
        let request = RoutingRequest::new("hi").with_model("phi4");
        let snapshot = RegistrySnapshot::new(
            1,
            vec![
                instance("a", Locality::Local, 0.0, &["phi4"]),
                instance("b", Locality::Remote, 0.0, &["phi4"]),
            ],
        );
        let excluded = BTreeSet::from([InstanceId::new("a", 11434)]);
        let decision = engine()
            .route(&request, &snapshot, &CapabilityModel::with_defaults(), &excluded)
            .unwrap();
        assert_eq!(decision.instance.host, "b");

        let excluded = BTreeSet::from([InstanceId::new("a", 11434), InstanceId::new("b", 11434)]);
        let err = engine()
            .route(&request, &snapshot, &CapabilityModel::with_defaults(), &excluded)
            .unwrap_err();
        assert_eq!(err.kind(), "no_healthy_instance");
    }

    #[test]
    fn test_ties_break_on_load_then_identity() {
        let request = RoutingRequest::new("hi").with_model("phi4");
        let engine = RoutingEngine::new(
            RoutingConfig {
                weights: crate::routing::ScoringWeights {
                    load_weight: 0.0,
                    ..Default::default()
                },
                ..Default::default()
            },
            Arc::new(OrchestratorMetrics::new()),
        );
        let decision = route(
            &engine,
            &request,
            vec![
                instance("c", Locality::Remote, 0.2, &["phi4"]),
                instance("b", Locality::Remote, 0.1, &["phi4"]),
                instance("a", Locality::Remote, 0.1, &["phi4"]),
            ],
        )
        .unwrap();
        assert_eq!(decision.instance.host, "a");
        assert_eq!(decision.runners_up[0].instance.host, "b");
        assert_eq!(decision.runners_up[1].instance.host, "c");
    }

    #[test]
    fn test_route_records_metrics() {
        let metrics = Arc::new(OrchestratorMetrics::new());
        let engine = RoutingEngine::new(RoutingConfig::default(), Arc::clone(&metrics));
        let snapshot =
            RegistrySnapshot::new(1, vec![instance("a", Locality::Local, 0.0, &["phi4"])]);
        let caps = CapabilityModel::with_defaults();

        engine
            .route(&RoutingRequest::new("hi"), &snapshot, &caps, &BTreeSet::new())
            .unwrap();
        let _ = engine.route(
            &RoutingRequest::new("hi").with_model("missing"),
            &snapshot,
            &caps,
            &BTreeSet::new(),
        );
        let _ = engine.evaluate(
            &RoutingRequest::new("hi").with_model("missing"),
            &snapshot,
            &caps,
            &BTreeSet::new(),
        );

        assert_eq!(metrics.routing_decisions.get(), 1);
        assert_eq!(metrics.no_capable_model.get(), 1);
    }
}
