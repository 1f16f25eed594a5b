//! Integration Tests for the Orchestrator
//!
//! End-to-end checks of the caller-facing surface against an in-memory
//! fleet, plus property checks of the Routing Engine over generated
//! registry snapshots.
//!
//! # Running
//!
//! ```bash
//! cargo test -p orchestrator-core --test orchestrator_tests
//! ```

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{config_for, local, remote, Fleet, Reply};
use orchestrator_core::capability::CapabilityModel;
use orchestrator_core::registry::{HealthState, Instance, Locality, RegistrySnapshot};
use orchestrator_core::routing::{RoutingConfig, RoutingEngine, RoutingRequest};
use orchestrator_core::{
    DispatchError, Infeasibility, InstanceId, Orchestrator, OrchestratorError,
    OrchestratorMetrics, Requirements, RouteParams, Tier,
};

// =============================================================================
// Fixtures
// =============================================================================

fn engine() -> RoutingEngine {
    RoutingEngine::new(RoutingConfig::default(), Arc::new(OrchestratorMetrics::new()))
}

fn instance(id: InstanceId, locality: Locality, load: f64, models: &[&str]) -> Instance {
    let mut instance = Instance::new(id, locality, 1);
    instance.health = HealthState::Healthy;
    instance.load = load;
    instance.models = models.iter().map(|m| (*m).to_string()).collect();
    instance
}

/// A fleet of `n` healthy instances with random loads and model subsets
fn random_snapshot(rng: &mut StdRng, n: u16) -> RegistrySnapshot {
    const MODELS: [&str; 5] = ["phi4", "qwen2.5:7b", "llama3.1:8b", "gpt-oss:20b", "codellama:33b"];
    let instances = (0..n)
        .map(|i| {
            let locality = if rng.gen_bool(0.5) {
                Locality::Local
            } else {
                Locality::Remote
            };
            let models: Vec<&str> = MODELS
                .iter()
                .copied()
                .filter(|_| rng.gen_bool(0.6))
                .collect();
            instance(
                InstanceId::new(format!("node-{i}"), 11434),
                locality,
                rng.gen_range(0.0..1.0),
                &models,
            )
        })
        .collect();
    RegistrySnapshot::new(1, instances)
}

fn no_exclusions() -> BTreeSet<InstanceId> {
    BTreeSet::new()
}

// =============================================================================
// Routing Properties
// =============================================================================

#[test]
fn explicit_model_is_always_honoured() {
    let mut rng = StdRng::seed_from_u64(7);
    let caps = CapabilityModel::with_defaults();
    let engine = engine();

    for _ in 0..50 {
        let snapshot = random_snapshot(&mut rng, 6);
        for (model, _) in snapshot.models_index() {
            let request = RoutingRequest::new("hello").with_model(model.clone());
            let decision = engine
                .route(&request, &snapshot, &caps, &no_exclusions())
                .unwrap();
            assert_eq!(decision.model, model);
            assert!(snapshot
                .get(&decision.instance)
                .is_some_and(|i| i.is_healthy() && i.models.contains(&model)));
        }
    }
}

#[test]
fn tier_floor_above_budget_is_budget_exceeded() {
    let mut rng = StdRng::seed_from_u64(11);
    let caps = CapabilityModel::with_defaults();
    let engine = engine();
    let snapshot = random_snapshot(&mut rng, 8);

    for tier in [Tier::Fast, Tier::Balanced, Tier::Powerful] {
        let floor = caps.envelope(tier).min();
        let budget = floor.mul_f64(0.5);
        let request = RoutingRequest::new("hello")
            .with_tier(tier)
            .with_max_latency(budget);
        let result = engine.route(&request, &snapshot, &caps, &no_exclusions());
        assert!(
            matches!(result, Err(Infeasibility::BudgetExceeded { .. })),
            "{tier}: {result:?}"
        );
    }
}

#[test]
fn routing_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(23);
    let caps = CapabilityModel::with_defaults();
    let engine = engine();

    for _ in 0..20 {
        let snapshot = random_snapshot(&mut rng, 10);
        let request = RoutingRequest::new("hello").with_tier(Tier::Balanced);
        let first = engine.route(&request, &snapshot, &caps, &no_exclusions());
        for _ in 0..10 {
            assert_eq!(
                engine.route(&request, &snapshot, &caps, &no_exclusions()),
                first
            );
        }
    }
}

#[test]
fn equal_scores_break_ties_by_instance_identity() {
    let caps = CapabilityModel::with_defaults();
    let snapshot = RegistrySnapshot::new(
        1,
        vec![
            instance(InstanceId::new("b-host", 11434), Locality::Remote, 0.2, &["phi4"]),
            instance(InstanceId::new("a-host", 11434), Locality::Remote, 0.2, &["phi4"]),
        ],
    );
    let decision = engine()
        .route(&RoutingRequest::new("hi"), &snapshot, &caps, &no_exclusions())
        .unwrap();
    assert_eq!(decision.instance, InstanceId::new("a-host", 11434));
}

#[test]
fn local_fast_instance_beats_idle_remote() {
    let caps = CapabilityModel::with_defaults();
    let a = instance(local(11434), Locality::Local, 0.1, &["phi4"]);
    let b = instance(remote("gpu-box"), Locality::Remote, 0.0, &["phi4"]);
    let snapshot = RegistrySnapshot::new(1, vec![a, b]);

    let request = RoutingRequest::new("hi").with_tier(Tier::Fast);
    let decision = engine()
        .route(&request, &snapshot, &caps, &no_exclusions())
        .unwrap();

    assert_eq!(decision.instance, local(11434));
    assert_eq!(decision.model, "phi4");
    assert_eq!(decision.runners_up[0].instance, remote("gpu-box"));
}

// =============================================================================
// Discovery Properties
// =============================================================================

#[tokio::test]
async fn refresh_is_idempotent_without_network_change() {
    let fleet = Fleet::new();
    fleet.add(&local(11434), &[("phi4", 2.8)]);
    fleet.add(&local(11435), &[("qwen2.5:7b", 4.7), ("phi4", 2.8)]);
    fleet.add(&remote("gpu-box"), &[("gpt-oss:20b", 20.0)]);
    let config = config_for(&[
        (&local(11434), Locality::Local),
        (&local(11435), Locality::Local),
        (&local(11436), Locality::Local),
        (&remote("gpu-box"), Locality::Remote),
    ]);
    let orchestrator = Orchestrator::new(config, Arc::new(fleet));

    orchestrator.refresh().await;
    let first = orchestrator.registry().snapshot();
    orchestrator.refresh().await;
    let second = orchestrator.registry().snapshot();

    assert_eq!(first.len(), 3);
    assert!(first.same_content(&second));
}

#[tokio::test]
async fn eviction_happens_exactly_at_threshold() {
    let fleet = Fleet::new();
    let id = local(11434);
    fleet.add(&id, &[("phi4", 2.8)]);
    let mut config = config_for(&[(&id, Locality::Local)]);
    config.discovery.eviction_threshold = 3;
    let orchestrator = Orchestrator::new(config, Arc::new(fleet.clone()));

    orchestrator.refresh().await;
    fleet.set_up(&id, false);

    orchestrator.refresh().await;
    orchestrator.refresh().await;
    let snapshot = orchestrator.registry().snapshot();
    let survivor = snapshot.get(&id).unwrap();
    assert_eq!(survivor.health, HealthState::Unreachable);
    assert_eq!(survivor.probe_failures, 2);

    let report = orchestrator.refresh().await;
    assert_eq!(report.evicted, vec![id.clone()]);
    assert!(orchestrator.registry().snapshot().get(&id).is_none());
}

#[tokio::test]
async fn list_models_maps_models_to_healthy_instances() {
    let fleet = Fleet::new();
    fleet.add(&local(11434), &[("phi4", 2.8)]);
    fleet.add(&remote("gpu-box"), &[("phi4", 2.8), ("gpt-oss:20b", 20.0)]);
    let config = config_for(&[
        (&local(11434), Locality::Local),
        (&remote("gpu-box"), Locality::Remote),
    ]);
    let orchestrator = Orchestrator::new(config, Arc::new(fleet));

    let models = orchestrator.list_models().await;
    assert_eq!(models["phi4"], vec![remote("gpu-box"), local(11434)]);
    assert_eq!(models["gpt-oss:20b"], vec![remote("gpu-box")]);
}

// =============================================================================
// Dispatch and Failover
// =============================================================================

#[tokio::test]
async fn timeout_fails_over_to_next_best_candidate() {
    let fleet = Fleet::new();
    let a = local(11434);
    let b = remote("gpu-box");
    fleet.add(&a, &[("phi4", 2.8)]);
    fleet.add(&b, &[("phi4", 2.8)]);
    fleet.set_reply(&a, Reply::Hang);
    let config = config_for(&[(&a, Locality::Local), (&b, Locality::Remote)]);
    let orchestrator = Orchestrator::new(config, Arc::new(fleet.clone()));

    let response = orchestrator
        .route_request(RouteParams::new("hello").with_tier(Tier::Fast))
        .await
        .unwrap();

    assert_eq!(response.instance_used, b);
    assert_eq!(fleet.generated(), vec![a.clone(), b.clone()]);
    assert_eq!(
        orchestrator.registry().get(&a).map(|i| i.health),
        Some(HealthState::Unreachable)
    );
    let metrics = orchestrator.metrics();
    assert_eq!(metrics.dispatch_retries.get(), 1);
    assert_eq!(metrics.dispatch_successes.get(), 1);
}

#[tokio::test]
async fn timeout_without_alternative_is_dispatch_failed() {
    let fleet = Fleet::new();
    let a = local(11434);
    fleet.add(&a, &[("phi4", 2.8)]);
    fleet.set_reply(&a, Reply::Hang);
    let config = config_for(&[(&a, Locality::Local)]);
    let orchestrator = Orchestrator::new(config, Arc::new(fleet));

    let err = orchestrator
        .route_request(RouteParams::new("hello").with_model("phi4"))
        .await
        .unwrap_err();

    match err {
        OrchestratorError::DispatchFailed(failure) => {
            assert_eq!(failure.attempted_instances(), vec![a]);
            assert!(matches!(failure, DispatchError::NoAlternative { .. }));
        }
        other => panic!("expected DispatchFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn status_errors_exhaust_the_retry_budget() {
    let fleet = Fleet::new();
    let ids = [local(11434), local(11435), local(11436)];
    for id in &ids {
        fleet.add(id, &[("phi4", 2.8)]);
        fleet.set_reply(id, Reply::Status(500));
    }
    let mut config = config_for(&[
        (&ids[0], Locality::Local),
        (&ids[1], Locality::Local),
        (&ids[2], Locality::Local),
    ]);
    config.dispatch.retry_budget = 1;
    let orchestrator = Orchestrator::new(config, Arc::new(fleet.clone()));

    let err = orchestrator
        .route_request(RouteParams::new("hello"))
        .await
        .unwrap_err();

    let OrchestratorError::DispatchFailed(failure) = err else {
        panic!("expected DispatchFailed");
    };
    assert!(matches!(failure, DispatchError::RetriesExhausted { .. }));
    assert_eq!(failure.attempts().len(), 2);
    assert_eq!(fleet.generated().len(), 2);
    // Status errors do not mark instances unreachable
    assert_eq!(orchestrator.registry().healthy_count(), 3);
}

#[tokio::test]
async fn budget_below_tier_floor_never_dispatches() {
    let fleet = Fleet::new();
    let a = local(11434);
    fleet.add(&a, &[("gpt-oss:20b", 20.0)]);
    let config = config_for(&[(&a, Locality::Local)]);
    let orchestrator = Orchestrator::new(config, Arc::new(fleet.clone()));

    let err = orchestrator
        .route_request(
            RouteParams::new("hello")
                .with_tier(Tier::Powerful)
                .with_max_time(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "budget_exceeded");
    assert!(fleet.generated().is_empty());
}

// =============================================================================
// Capability Assessment
// =============================================================================

#[tokio::test]
async fn reasoning_task_without_reasoning_model_is_infeasible() {
    let fleet = Fleet::new();
    fleet.add(&local(11434), &[("phi4", 2.8), ("qwen2.5:7b", 4.7)]);
    let config = config_for(&[(&local(11434), Locality::Local)]);
    let orchestrator = Orchestrator::new(config, Arc::new(fleet.clone()));
    orchestrator.discover_instances().await;

    let assessment = orchestrator.assess_capability(
        "Walk through a multi-step proof",
        Some(Requirements::default().with_tag("reasoning")),
    );

    assert!(!assessment.can_handle);
    assert!(matches!(
        assessment.infeasible,
        Some(Infeasibility::NoCapableModel { .. })
    ));
    assert!(fleet.generated().is_empty());
    assert_eq!(orchestrator.metrics().routing_decisions.get(), 0);
}

#[tokio::test]
async fn assessment_reports_best_candidate_latency() {
    let fleet = Fleet::new();
    fleet.add(&local(11434), &[("phi4", 2.8)]);
    fleet.add(&remote("gpu-box"), &[("gpt-oss:20b", 20.0)]);
    let config = config_for(&[
        (&local(11434), Locality::Local),
        (&remote("gpu-box"), Locality::Remote),
    ]);
    let orchestrator = Orchestrator::new(config, Arc::new(fleet.clone()));
    orchestrator.discover_instances().await;

    let assessment = orchestrator.assess_capability("Check this multi-step reasoning", None);

    assert!(assessment.can_handle);
    assert_eq!(assessment.model.as_deref(), Some("gpt-oss:20b"));
    assert_eq!(assessment.instance, Some(remote("gpu-box")));
    // powerful midpoint at zero load
    let estimate = assessment.estimated_seconds.unwrap();
    assert!((estimate - 0.6).abs() < 1e-9, "{estimate}");
    assert!(fleet.generated().is_empty());
}
