//! Orchestrator Core - Placement of Inference Requests Across an Ollama Fleet
//!
//! This crate discovers model-serving instances, classifies the models they
//! advertise, picks the best (instance, model) pair for each request and
//! fails over when an instance misbehaves. It has no UI and no server of
//! its own; the `ollama-master` binary and any tool-calling agent drive it
//! through [`Orchestrator`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Callers                                  │
//! │      CLI (ollama-master)          Tool-calling agent             │
//! └──────────────────────────────┬───────────────────────────────────┘
//!                                │ discover_instances / route_request
//!                                │ list_models / assess_capability
//! ┌──────────────────────────────┴───────────────────────────────────┐
//! │                        ORCHESTRATOR CORE                         │
//! │                                                                  │
//! │  ┌────────────┐   writes   ┌──────────────┐  snapshot  ┌────────┐│
//! │  │ Discovery  │──────────► │   Instance   │──────────► │Routing ││
//! │  │  Engine    │            │   Registry   │            │ Engine ││
//! │  └─────┬──────┘            └──────▲───────┘            └───┬────┘│
//! │        │ promote                  │ latency / failure      │     │
//! │  ┌─────▼──────┐                   │                  ┌─────▼────┐│
//! │  │ Capability │◄──────────────────┼──────────────────│Dispatcher││
//! │  │   Model    │     classify      └──────────────────│/Failover ││
//! │  └────────────┘                                      └─────┬────┘│
//! └────────────────────────────────────────────────────────────┼─────┘
//!                                                              │
//!                                     InferenceBackend (Ollama HTTP)
//! ```
//!
//! # Key Types
//!
//! - [`Orchestrator`]: The facade owning every component
//! - [`InstanceRegistry`]: Versioned store of known instances
//! - [`DiscoveryEngine`]: Probes the address space and feeds the registry
//! - [`CapabilityModel`]: Model id to tier, tags and latency envelope
//! - [`RoutingEngine`]: Deterministic scoring over one registry snapshot
//! - [`Dispatcher`]: Executes decisions and fails over within a retry budget
//!
//! # Quick Start
//!
//! ```ignore
//! use orchestrator_core::{config::load_config, Orchestrator, RouteParams, Tier};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::from_config(load_config()?)?;
//!     let discovery = orchestrator.spawn_discovery();
//!
//!     let answer = orchestrator
//!         .route_request(RouteParams::new("Why is the sky blue?").with_tier(Tier::Fast))
//!         .await?;
//!     println!("{} answered: {}", answer.instance_used, answer.response);
//!
//!     discovery.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Inference backend trait and the Ollama HTTP client
//! - [`capability`]: Tiers, latency envelopes and the model catalogue
//! - [`config`]: TOML, environment and CLI configuration
//! - [`discovery`]: Address space and the Discovery Engine
//! - [`dispatch`]: Dispatcher and the per-request state machine
//! - [`keywords`]: Whole-word matching over prompts and task descriptions
//! - [`metrics`]: Counters, histograms and Prometheus export
//! - [`orchestrator`]: The caller-facing facade
//! - [`registry`]: Instance records and snapshots
//! - [`routing`]: Candidate filtering, scoring and ranking
//! - [`workflow`]: Multi-step workflow templates

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod capability;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod keywords;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod routing;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenience
pub use backend::{BackendError, InferenceBackend, OllamaClient};
pub use capability::{CapabilityModel, ModelCapability, Tier};
pub use config::{load_config, ConfigError, ConfigOverrides, OrchestratorConfig};
pub use discovery::{DiscoveryEngine, DiscoveryHandle, RefreshReport};
pub use dispatch::{Attempt, DispatchError, Dispatcher};
pub use metrics::OrchestratorMetrics;
pub use orchestrator::{
    Assessment, Orchestrator, OrchestratorError, Requirements, RouteParams, RouteResponse,
    MAX_REQUEST_DEADLINE,
};
pub use registry::{HealthState, Instance, InstanceId, InstanceRegistry, Locality};
pub use routing::{Infeasibility, RoutingDecision, RoutingEngine, RoutingRequest};
pub use workflow::{
    AutoOutcome, ModelChoice, StepKind, StepOutcome, WorkflowCatalogue, WorkflowRun,
    WorkflowStatus, WorkflowStep, WorkflowTemplate,
};
