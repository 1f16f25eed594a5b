//! Orchestrator Facade
//!
//! The surface exposed to callers (a CLI, a tool-calling agent):
//!
//! | Operation | Effect |
//! |---|---|
//! | [`Orchestrator::discover_instances`] | Refresh the registry, return every known instance |
//! | [`Orchestrator::route_request`] | Route, dispatch and fail over one request |
//! | [`Orchestrator::list_models`] | Model id to the healthy instances serving it |
//! | [`Orchestrator::assess_capability`] | Dry-run routing for a task; no dispatch |
//!
//! # Ownership
//!
//! ```text
//! Orchestrator
//!   ├── InstanceRegistry   (Arc, written by discovery and dispatch feedback)
//!   ├── CapabilityModel    (Arc, promoted into by discovery)
//!   ├── DiscoveryEngine    (Arc, may run a background loop)
//!   ├── RoutingEngine      (Arc, shared with the dispatcher for re-routes)
//!   ├── Dispatcher
//!   └── OrchestratorMetrics
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::backend::{BackendError, InferenceBackend, OllamaClient};
use crate::capability::{CapabilityModel, Tier};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::discovery::{DiscoveryEngine, DiscoveryHandle, RefreshReport};
use crate::dispatch::{Attempt, DispatchError, Dispatcher};
use crate::keywords::Words;
use crate::metrics::OrchestratorMetrics;
use crate::registry::{Instance, InstanceId, InstanceRegistry};
use crate::routing::{Infeasibility, RoutingDecision, RoutingEngine, RoutingRequest};
use crate::workflow::WorkflowCatalogue;

/// Longest deadline a single request may run under
pub const MAX_REQUEST_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

fn serialize_opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the facade
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No candidate could be chosen
    #[error("request is infeasible: {0}")]
    Infeasible(#[from] Infeasibility),

    /// Dispatch failed terminally
    #[error(transparent)]
    DispatchFailed(#[from] DispatchError),

    /// The backend client could not be built
    #[error("backend unavailable: {0}")]
    Backend(#[from] BackendError),

    /// Configuration was rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Request parameters were rejected before routing
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No workflow template has this name
    #[error("unknown workflow '{name}', available: {available}")]
    UnknownWorkflow {
        /// Requested name
        name: String,
        /// Known template names, comma separated
        available: String,
    },
}

impl OrchestratorError {
    /// Short machine-readable name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Infeasible(reason) => reason.kind(),
            Self::DispatchFailed(_) => "dispatch_failed",
            Self::Backend(_) => "backend",
            Self::Config(_) => "config",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownWorkflow { .. } => "unknown_workflow",
        }
    }
}

// ============================================================================
// route_request
// ============================================================================

/// Parameters of [`Orchestrator::route_request`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteParams {
    /// Prompt text
    pub prompt: String,
    /// Explicit model
    pub model: Option<String>,
    /// Desired tier
    pub tier: Option<Tier>,
    /// Latency budget, also the overall deadline
    pub max_time: Option<Duration>,
    /// Backend generation options
    pub options: Option<serde_json::Value>,
}

impl RouteParams {
    /// Parameters for `prompt` with no constraints
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Require a model
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

    /// Set the time budget
    #[must_use]
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Attach generation options
    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = Some(options);
        self
    }

    fn into_request(self) -> RoutingRequest {
        let mut request = RoutingRequest::new(self.prompt);
        request.model = self.model;
        request.tier = self.tier;
        request.max_latency = self.max_time;
        request.options = self.options;
        request
    }
}

/// Result of a completed request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteResponse {
    /// Request ID
    pub request_id: String,
    /// Generated text
    pub response: String,
    /// Instance that answered
    pub instance_used: InstanceId,
    /// Model that answered
    pub model_used: String,
    /// Every attempt, the successful one last
    pub attempts: Vec<Attempt>,
    /// Why the answering instance was chosen
    pub rationale: String,
    /// Latency of the successful attempt, in seconds
    pub latency_secs: f64,
}

// ============================================================================
// assess_capability
// ============================================================================

/// What a task needs from the fleet
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Requirements {
    /// Explicit model
    pub model: Option<String>,
    /// Tier
    pub tier: Option<Tier>,
    /// Task tags, any of which suffices
    pub tags: BTreeSet<String>,
    /// Time budget
    #[serde(serialize_with = "serialize_opt_secs")]
    pub max_time: Option<Duration>,
}

impl Requirements {
    /// Requirements guessed from a free-text task description
    ///
    /// Keywords match whole words only:
    /// - "quick", "simple" → `fast`
    /// - "large document", "50-page" → `powerful`
    /// - "code", "coding" → tag `code`
    /// - "reason", "reasoning", "proof", "prove", "multi-step" → tag `reasoning`
    #[must_use]
    pub fn from_description(description: &str) -> Self {
        let words = Words::new(description);

        let mut requirements = Self::default();
        if words.any_phrase(&["large document", "large documents"]) || words.any(&["50-page"]) {
            requirements.tier = Some(Tier::Powerful);
        } else if words.any(&["quick", "quickly", "simple"]) {
            requirements.tier = Some(Tier::Fast);
        }
        if words.any(&["code", "coding"]) {
            requirements.tags.insert("code".to_string());
        }
        if words.any(&["reason", "reasons", "reasoning", "proof", "prove", "multi-step"]) {
            requirements.tags.insert("reasoning".to_string());
        }
        requirements
    }

    /// Require a tier
    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Require a tag
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Set a time budget
    #[must_use]
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Require a model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn to_request(&self, description: &str) -> RoutingRequest {
        let mut request = RoutingRequest::new(description).with_required_tags(self.tags.clone());
        request.model = self.model.clone();
        request.tier = self.tier;
        request.max_latency = self.max_time;
        request
    }
}

/// Answer to "can the fleet handle this?"
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Assessment {
    /// Whether routing would succeed right now
    pub can_handle: bool,
    /// Human-readable recommendation
    pub recommended_approach: String,
    /// Estimated latency of the best candidate
    pub estimated_seconds: Option<f64>,
    /// Best instance
    pub instance: Option<InstanceId>,
    /// Best model
    pub model: Option<String>,
    /// Tier of the best model
    pub tier: Option<Tier>,
    /// Requirements the assessment ran with
    pub requirements: Requirements,
    /// Why the task cannot be handled
    pub infeasible: Option<Infeasibility>,
}

impl Assessment {
    fn feasible(decision: &RoutingDecision, requirements: Requirements) -> Self {
        let estimated = decision.estimated_latency.as_secs_f64();
        Self {
            can_handle: true,
            recommended_approach: format!(
                "Use {} ({} tier) on {} instance {}, about {estimated:.1}s",
                decision.model, decision.tier, decision.locality, decision.instance
            ),
            estimated_seconds: Some(estimated),
            instance: Some(decision.instance.clone()),
            model: Some(decision.model.clone()),
            tier: Some(decision.tier),
            requirements,
            infeasible: None,
        }
    }

    fn infeasible(reason: Infeasibility, requirements: Requirements) -> Self {
        let recommended_approach = match &reason {
            Infeasibility::NoCapableModel { requirement, .. } => format!(
                "No loaded model satisfies {requirement}; \
                 load one that does or relax the requirements"
            ),
            Infeasibility::NoHealthyInstance { models, .. } => format!(
                "Wait for an instance serving {} to become healthy",
                models.join(", ")
            ),
            Infeasibility::BudgetExceeded { minimum_secs, .. } => {
                format!("Allow at least {minimum_secs:.1}s or choose a faster tier")
            }
        };
        Self {
            can_handle: false,
            recommended_approach,
            estimated_seconds: None,
            instance: None,
            model: None,
            tier: None,
            requirements,
            infeasible: Some(reason),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Discovery, routing and dispatch over one fleet
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<InstanceRegistry>,
    capabilities: Arc<CapabilityModel>,
    metrics: Arc<OrchestratorMetrics>,
    discovery: Arc<DiscoveryEngine>,
    router: Arc<RoutingEngine>,
    dispatcher: Dispatcher,
    workflows: WorkflowCatalogue,
}

impl Orchestrator {
    /// Build an orchestrator over `backend`
    pub fn new(config: OrchestratorConfig, backend: Arc<dyn InferenceBackend>) -> Self {
        let registry = Arc::new(InstanceRegistry::new(config.discovery.eviction_threshold));
        let capabilities = Arc::new(CapabilityModel::new(&config.capability));
        let metrics = Arc::new(OrchestratorMetrics::new());

        let discovery = Arc::new(DiscoveryEngine::new(
            Arc::clone(&backend),
            Arc::clone(&registry),
            Arc::clone(&capabilities),
            Arc::clone(&metrics),
            config.discovery.clone(),
        ));
        let router = Arc::new(RoutingEngine::new(
            config.routing.clone(),
            Arc::clone(&metrics),
        ));
        let dispatcher = Dispatcher::new(
            backend,
            Arc::clone(&registry),
            Arc::clone(&capabilities),
            Arc::clone(&router),
            Arc::clone(&metrics),
            config.dispatch.clone(),
        );

        tracing::debug!(
            targets = config.discovery.address_space.len(),
            source = %config.source(),
            "Orchestrator created"
        );

        Self {
            config,
            registry,
            capabilities,
            metrics,
            discovery,
            router,
            dispatcher,
            workflows: WorkflowCatalogue::default(),
        }
    }

    /// Replace the built-in workflow templates
    #[must_use]
    pub fn with_workflows(mut self, workflows: WorkflowCatalogue) -> Self {
        self.workflows = workflows;
        self
    }

    /// Build an orchestrator talking to Ollama over HTTP
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let backend: Arc<dyn InferenceBackend> = Arc::new(OllamaClient::new()?);
        Ok(Self::new(config, backend))
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Instance registry
    #[must_use]
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Capability model
    #[must_use]
    pub fn capabilities(&self) -> &Arc<CapabilityModel> {
        &self.capabilities
    }

    /// Metrics
    #[must_use]
    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }

    /// Workflow templates
    #[must_use]
    pub fn workflows(&self) -> &WorkflowCatalogue {
        &self.workflows
    }

    /// Run one discovery refresh
    pub async fn refresh(&self) -> RefreshReport {
        self.discovery.refresh().await
    }

    /// Start the background discovery loop
    pub fn spawn_discovery(&self) -> DiscoveryHandle {
        Arc::clone(&self.discovery).spawn_periodic()
    }

    /// Refresh the registry and return every known instance
    pub async fn discover_instances(&self) -> Vec<Instance> {
        let report = self.discovery.refresh().await;
        tracing::info!(
            healthy = report.healthy,
            known = report.known,
            failures = report.failures.len(),
            "Discovery complete"
        );
        self.registry.snapshot().instances().to_vec()
    }

    /// Model id to the healthy instances serving it
    ///
    /// Refreshes first if the registry is stale.
    pub async fn list_models(&self) -> BTreeMap<String, Vec<InstanceId>> {
        self.discovery.refresh_if_stale().await;
        self.registry.snapshot().models_index()
    }

    /// Route `params` to the best instance and return its answer
    ///
    /// A stale registry is refreshed before routing. If no healthy instance
    /// serves a capable model, the registry is refreshed once more and
    /// routing retried. `max_time` bounds both candidate latency and the
    /// whole call, retries included.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidRequest`] for a zero `max_time`,
    /// [`OrchestratorError::Infeasible`] if no candidate fits,
    /// [`OrchestratorError::DispatchFailed`] with the attempt history if
    /// every attempt failed.
    pub async fn route_request(
        &self,
        params: RouteParams,
    ) -> Result<RouteResponse, OrchestratorError> {
        let budget = params
            .max_time
            .unwrap_or(self.config.dispatch.default_deadline);
        if budget.is_zero() {
            return Err(OrchestratorError::InvalidRequest(
                "max_time must be positive".to_string(),
            ));
        }
        let now = Instant::now();
        let deadline = now
            .checked_add(budget.min(MAX_REQUEST_DEADLINE))
            .unwrap_or(now);
        let request = params.into_request();

        let refreshed = self.discovery.refresh_if_stale().await.is_some();
        let decision = match self.route_once(&request) {
            Err(Infeasibility::NoHealthyInstance { .. }) if !refreshed => {
                tracing::debug!(
                    request_id = %request.request_id,
                    "No healthy instance, refreshing before giving up"
                );
                self.discovery.refresh().await;
                self.route_once(&request)
            }
            other => other,
        }?;

        let outcome = self.dispatcher.dispatch(decision, &request, deadline).await?;
        Ok(RouteResponse {
            request_id: request.request_id,
            response: outcome.response.response,
            instance_used: outcome.decision.instance,
            model_used: outcome.decision.model,
            attempts: outcome.attempts,
            rationale: outcome.decision.rationale,
            latency_secs: outcome.latency.as_secs_f64(),
        })
    }

    fn route_once(&self, request: &RoutingRequest) -> Result<RoutingDecision, Infeasibility> {
        let snapshot = self.registry.snapshot();
        self.router
            .route(request, &snapshot, &self.capabilities, &BTreeSet::new())
    }

    /// Whether the fleet could handle a task, without dispatching anything
    ///
    /// With no `requirements`, they are guessed from the description. Runs
    /// against the current registry as is; no refresh, no metrics.
    pub fn assess_capability(
        &self,
        description: &str,
        requirements: Option<Requirements>,
    ) -> Assessment {
        let requirements =
            requirements.unwrap_or_else(|| Requirements::from_description(description));
        let request = requirements.to_request(description);
        let snapshot = self.registry.snapshot();

        match self
            .router
            .evaluate(&request, &snapshot, &self.capabilities, &BTreeSet::new())
        {
            Ok(decision) => Assessment::feasible(&decision, requirements),
            Err(reason) => {
                tracing::debug!(reason = reason.kind(), "Assessment infeasible: {reason}");
                Assessment::infeasible(reason, requirements)
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("discovery", &self.discovery)
            .field("registry_version", &self.registry.version())
            .finish_non_exhaustive()
    }
}
