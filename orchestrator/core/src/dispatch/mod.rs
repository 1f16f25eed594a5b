//! Dispatcher / Failover Controller
//!
//! Executes a routing decision against its instance and handles failure.
//!
//! # Per-request state machine
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            ▼                                          │
//!        ┌────────┐    ┌────────────┐    ┌───────────┐  │
//!   ───► │ Routed │──► │ Dispatched │──► │ Succeeded │  │
//!        └────────┘    └────────────┘    └───────────┘  │
//!            │              │                           │
//!            │              ├──► Retrying ──────────────┘
//!            │              │       │
//!            ▼              ▼       ▼
//!        ┌──────────────────────────────┐
//!        │            Failed            │
//!        └──────────────────────────────┘
//! ```
//!
//! Each attempt is bounded by `estimated latency × grace factor`, clipped to
//! what is left of the caller's deadline. Retries share that one deadline.
//! A timeout or transport error marks the instance `unreachable`; any
//! failed attempt excludes its instance from re-routing for this request.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::backend::{BackendError, GenerateRequest, GenerateResponse, InferenceBackend};
use crate::capability::{saturating_secs, CapabilityModel};
use crate::metrics::{AttemptFailureKind, OrchestratorMetrics};
use crate::registry::{InstanceId, InstanceRegistry, DEFAULT_LOAD_DECAY};
use crate::routing::{Infeasibility, RoutingDecision, RoutingEngine, RoutingRequest};

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

// ============================================================================
// Configuration
// ============================================================================

/// Dispatcher configuration
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchConfig {
    /// Re-routes allowed after a failed attempt
    pub retry_budget: u32,
    /// Attempt timeout as a multiple of the estimated latency
    pub grace_factor: f64,
    /// EMA weight of a new load sample
    pub load_decay: f64,
    /// Deadline used when the caller gives none
    pub default_deadline: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_budget: 1,
            grace_factor: 2.0,
            load_decay: DEFAULT_LOAD_DECAY,
            default_deadline: Duration::from_secs(120),
        }
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// Where a request is in its dispatch lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    /// A decision exists, nothing sent yet
    Routed,
    /// An attempt is in flight
    Dispatched,
    /// The request completed
    Succeeded,
    /// An attempt failed and retry budget remains
    Retrying,
    /// Terminal failure
    Failed,
}

impl DispatchState {
    /// Whether `next` is a legal successor
    #[must_use]
    pub fn can_transition_to(&self, next: DispatchState) -> bool {
        use DispatchState::*;
        matches!(
            (self, next),
            (Routed, Dispatched)
                | (Routed, Failed)
                | (Dispatched, Succeeded)
                | (Dispatched, Retrying)
                | (Dispatched, Failed)
                | (Retrying, Routed)
                | (Retrying, Failed)
        )
    }

    /// Whether the state is final
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    fn advance(&mut self, next: DispatchState, request_id: &str) {
        debug_assert!(
            self.can_transition_to(next),
            "illegal dispatch transition {} -> {}",
            self,
            next
        );
        tracing::trace!(request_id, from = %self, to = %next, "Dispatch state");
        *self = next;
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Routed => "routed",
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Attempts and Errors
// ============================================================================

/// Why one attempt failed
#[derive(Clone, Debug, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptError {
    /// No answer within the attempt timeout
    #[error("dispatch timed out after {after_secs:.2}s")]
    Timeout {
        /// Timeout applied
        after_secs: f64,
    },

    /// Connection-level failure
    #[error("dispatch transport error: {message}")]
    Transport {
        /// Underlying error
        message: String,
    },

    /// The instance refused the request
    #[error("instance returned {status}: {body}")]
    Status {
        /// HTTP status
        status: u16,
        /// Response body
        body: String,
    },

    /// The instance answered with something unreadable
    #[error("malformed response: {message}")]
    Decode {
        /// Underlying error
        message: String,
    },
}

impl AttemptError {
    /// Whether the failure marks the instance `unreachable`
    #[must_use]
    pub fn is_instance_fault(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }

    fn metric_kind(&self) -> AttemptFailureKind {
        match self {
            Self::Timeout { .. } => AttemptFailureKind::Timeout,
            Self::Transport { .. } => AttemptFailureKind::Transport,
            Self::Status { .. } | Self::Decode { .. } => AttemptFailureKind::Status,
        }
    }
}

impl From<BackendError> for AttemptError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Timeout(after) => Self::Timeout {
                after_secs: after.as_secs_f64(),
            },
            BackendError::Transport(message) | BackendError::Setup(message) => {
                Self::Transport { message }
            }
            BackendError::Status { status, body } => Self::Status { status, body },
            BackendError::Decode(message) => Self::Decode { message },
        }
    }
}

/// One attempt against one instance
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Attempt {
    /// Instance tried
    pub instance: InstanceId,
    /// Model requested
    pub model: String,
    /// Time spent
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// Failure, if any
    pub error: Option<AttemptError>,
}

impl Attempt {
    /// Whether the attempt succeeded
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Terminal dispatch failure, with every attempt made
#[derive(Clone, Debug, Error, PartialEq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum DispatchError {
    /// The last allowed attempt failed
    #[error("dispatch failed after {} attempt(s): retry budget exhausted", .attempts.len())]
    RetriesExhausted {
        /// Attempt history, oldest first
        attempts: Vec<Attempt>,
    },

    /// A retry found no candidate left to route to
    #[error("dispatch failed after {} attempt(s): {reason}", .attempts.len())]
    NoAlternative {
        /// Attempt history, oldest first
        attempts: Vec<Attempt>,
        /// Why re-routing failed
        reason: Infeasibility,
    },

    /// The caller's deadline ran out
    #[error("dispatch failed after {} attempt(s): deadline exceeded", .attempts.len())]
    DeadlineExceeded {
        /// Attempt history, oldest first
        attempts: Vec<Attempt>,
    },
}

impl DispatchError {
    /// Attempt history, oldest first
    #[must_use]
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            Self::RetriesExhausted { attempts }
            | Self::NoAlternative { attempts, .. }
            | Self::DeadlineExceeded { attempts } => attempts,
        }
    }

    /// Instances tried, in order
    #[must_use]
    pub fn attempted_instances(&self) -> Vec<InstanceId> {
        self.attempts().iter().map(|a| a.instance.clone()).collect()
    }
}

/// A completed request
#[derive(Clone, Debug)]
pub struct DispatchOutcome {
    /// Backend response
    pub response: GenerateResponse,
    /// Decision that succeeded
    pub decision: RoutingDecision,
    /// Every attempt, the successful one last
    pub attempts: Vec<Attempt>,
    /// Latency of the successful attempt
    pub latency: Duration,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Executes decisions and fails over within the retry budget
pub struct Dispatcher {
    backend: Arc<dyn InferenceBackend>,
    registry: Arc<InstanceRegistry>,
    capabilities: Arc<CapabilityModel>,
    router: Arc<RoutingEngine>,
    metrics: Arc<OrchestratorMetrics>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        registry: Arc<InstanceRegistry>,
        capabilities: Arc<CapabilityModel>,
        router: Arc<RoutingEngine>,
        metrics: Arc<OrchestratorMetrics>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            capabilities,
            router,
            metrics,
            config,
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Timeout for one attempt at `decision`
    #[must_use]
    pub fn attempt_timeout(&self, decision: &RoutingDecision) -> Duration {
        let grace = self.config.grace_factor.max(1.0);
        saturating_secs(decision.estimated_latency.as_secs_f64() * grace)
    }

    /// Execute `decision`, re-routing on failure until the retry budget or
    /// `deadline` runs out
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] with the full attempt history when the
    /// request cannot be completed.
    pub async fn dispatch(
        &self,
        decision: RoutingDecision,
        request: &RoutingRequest,
        deadline: Instant,
    ) -> Result<DispatchOutcome, DispatchError> {
        let request_id = request.request_id.as_str();
        let mut state = DispatchState::Routed;
        let mut decision = decision;
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut excluded: BTreeSet<InstanceId> = BTreeSet::new();
        let mut retries_left = self.config.retry_budget;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.advance(DispatchState::Failed, request_id);
                return Err(self.fail(DispatchError::DeadlineExceeded { attempts }));
            }
            let timeout = self.attempt_timeout(&decision).min(remaining);

            state.advance(DispatchState::Dispatched, request_id);
            self.metrics.record_attempt(&decision.instance);
            tracing::debug!(
                request_id,
                instance = %decision.instance,
                model = %decision.model,
                timeout_ms = timeout.as_millis() as u64,
                attempt = attempts.len() + 1,
                "Dispatching"
            );

            let mut generate = GenerateRequest::new(decision.model.clone(), request.prompt.clone());
            if let Some(ref options) = request.options {
                generate = generate.with_options(options.clone());
            }

            let started = Instant::now();
            let result = tokio::time::timeout(
                timeout,
                self.backend.generate(&decision.instance, &generate, timeout),
            )
            .await
            .unwrap_or(Err(BackendError::Timeout(timeout)));
            let elapsed = started.elapsed();

            let error = match result {
                Ok(response) => {
                    self.record_success(&decision, elapsed);
                    attempts.push(Attempt {
                        instance: decision.instance.clone(),
                        model: decision.model.clone(),
                        elapsed,
                        error: None,
                    });
                    state.advance(DispatchState::Succeeded, request_id);
                    tracing::info!(
                        request_id,
                        instance = %decision.instance,
                        model = %decision.model,
                        latency_ms = elapsed.as_millis() as u64,
                        attempts = attempts.len(),
                        "Request completed"
                    );
                    return Ok(DispatchOutcome {
                        response,
                        decision,
                        attempts,
                        latency: elapsed,
                    });
                }
                Err(e) => AttemptError::from(e),
            };

            self.record_failure(&decision, &error, request_id);
            excluded.insert(decision.instance.clone());
            attempts.push(Attempt {
                instance: decision.instance.clone(),
                model: decision.model.clone(),
                elapsed,
                error: Some(error),
            });

            if retries_left == 0 {
                state.advance(DispatchState::Failed, request_id);
                return Err(self.fail(DispatchError::RetriesExhausted { attempts }));
            }
            retries_left -= 1;
            state.advance(DispatchState::Retrying, request_id);
            self.metrics.record_retry();

            if Instant::now() >= deadline {
                state.advance(DispatchState::Failed, request_id);
                return Err(self.fail(DispatchError::DeadlineExceeded { attempts }));
            }

            let snapshot = self.registry.snapshot();
            match self
                .router
                .route(request, &snapshot, &self.capabilities, &excluded)
            {
                Ok(next) => {
                    tracing::info!(
                        request_id,
                        failed = %decision.instance,
                        next = %next.instance,
                        model = %next.model,
                        "Retrying on next-best candidate"
                    );
                    decision = next;
                    state.advance(DispatchState::Routed, request_id);
                }
                Err(reason) => {
                    state.advance(DispatchState::Failed, request_id);
                    return Err(self.fail(DispatchError::NoAlternative { attempts, reason }));
                }
            }
        }
    }

    fn record_success(&self, decision: &RoutingDecision, elapsed: Duration) {
        self.metrics
            .record_attempt_success(&decision.instance, elapsed);
        let envelope = self.capabilities.envelope(decision.tier);
        self.registry.record_dispatch_success(
            &decision.instance,
            elapsed,
            &envelope,
            self.config.load_decay,
        );
    }

    fn record_failure(&self, decision: &RoutingDecision, error: &AttemptError, request_id: &str) {
        self.metrics
            .record_attempt_failure(&decision.instance, error.metric_kind());
        let reason = error.to_string();
        if error.is_instance_fault() {
            self.registry
                .record_dispatch_failure(&decision.instance, &reason);
        } else {
            tracing::warn!(
                request_id,
                instance = %decision.instance,
                model = %decision.model,
                error = %reason,
                "Instance rejected request"
            );
        }
    }

    fn fail(&self, error: DispatchError) -> DispatchError {
        self.metrics.record_dispatch_failed();
        tracing::warn!(
            attempts = error.attempts().len(),
            instances = ?error.attempted_instances(),
            "{error}"
        );
        error
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}
