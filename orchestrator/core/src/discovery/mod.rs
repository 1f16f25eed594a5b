//! Discovery Engine
//!
//! Keeps the Instance Registry populated from a finite address space.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     DiscoveryEngine                      │
//! │                                                          │
//! │   AddressSpace ──► candidates ──► probe (concurrent)     │
//! │                                    │                     │
//! │                 list-models ◄──────┤ per-probe timeout   │
//! │                 running-models ◄───┘ (best effort)       │
//! │                                    │                     │
//! │   CapabilityModel ◄── promote ─────┤                     │
//! │   InstanceRegistry ◄── success / failure / eviction      │
//! │   OrchestratorMetrics ◄── probes, fleet gauges           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed probe only changes the affected instance's health. Losing every
//! instance shows up in metrics, never as an error.

mod address;

pub use address::{
    default_locality, AddressSpace, DiscoveryTarget, PortRange, ProbeTarget, DEFAULT_PORT,
};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::backend::{BackendError, InferenceBackend};
use crate::capability::CapabilityModel;
use crate::metrics::OrchestratorMetrics;
use crate::registry::{InstanceId, InstanceRegistry, ProbeTransition, DEFAULT_EVICTION_THRESHOLD};

/// Shortest interval the periodic driver accepts
const MIN_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Configuration
// ============================================================================

/// Discovery configuration
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryConfig {
    /// Addresses to probe
    pub address_space: AddressSpace,
    /// Interval between background refreshes
    pub interval: Duration,
    /// Timeout for each probe
    pub probe_timeout: Duration,
    /// Consecutive probe failures before eviction
    pub eviction_threshold: u32,
    /// Registry age that forces a refresh before routing
    pub staleness_ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            address_space: AddressSpace::default(),
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            eviction_threshold: DEFAULT_EVICTION_THRESHOLD,
            staleness_ttl: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Refresh Report
// ============================================================================

/// A probe that failed during a refresh
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProbeFailure {
    /// Address probed
    pub instance: InstanceId,
    /// What went wrong
    pub error: String,
    /// Whether the address was a known instance
    pub known: bool,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "discovery probe failed for {}: {}", self.instance, self.error)
    }
}

/// Outcome of one refresh
#[derive(Clone, Debug, Serialize)]
pub struct RefreshReport {
    /// Registry version after the refresh
    pub version: u64,
    /// Addresses probed
    pub probed: usize,
    /// Instances that answered
    pub discovered: Vec<InstanceId>,
    /// Instances newly inserted or recovered
    pub came_up: Vec<InstanceId>,
    /// Probes that failed
    pub failures: Vec<ProbeFailure>,
    /// Instances evicted by this refresh
    pub evicted: Vec<InstanceId>,
    /// Models learned during this refresh
    pub promoted: Vec<String>,
    /// Healthy instances after the refresh
    pub healthy: usize,
    /// Known instances after the refresh
    pub known: usize,
    /// Wall time spent
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl RefreshReport {
    /// Whether no instance is healthy
    #[must_use]
    pub fn fleet_lost(&self) -> bool {
        self.healthy == 0
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// What one probe found
struct ProbeResult {
    models: BTreeSet<String>,
    warm: BTreeSet<String>,
    promoted: Vec<String>,
}

// ============================================================================
// Discovery Engine
// ============================================================================

/// Probes the address space and feeds the registry
pub struct DiscoveryEngine {
    backend: Arc<dyn InferenceBackend>,
    registry: Arc<InstanceRegistry>,
    capabilities: Arc<CapabilityModel>,
    metrics: Arc<OrchestratorMetrics>,
    config: DiscoveryConfig,
    /// Serializes refreshes; concurrent callers wait for the running one
    refresh_lock: Mutex<()>,
}

impl DiscoveryEngine {
    /// Create a discovery engine
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        registry: Arc<InstanceRegistry>,
        capabilities: Arc<CapabilityModel>,
        metrics: Arc<OrchestratorMetrics>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            capabilities,
            metrics,
            config,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Whether the registry is older than the staleness TTL
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.registry.is_stale(self.config.staleness_ttl)
    }

    /// Refresh over the configured address space
    pub async fn refresh(&self) -> RefreshReport {
        self.refresh_space(&self.config.address_space).await
    }

    /// Refresh if the registry is stale, otherwise do nothing
    ///
    /// Returns the report if a refresh ran.
    pub async fn refresh_if_stale(&self) -> Option<RefreshReport> {
        if self.is_stale() {
            Some(self.refresh().await)
        } else {
            None
        }
    }

    /// Probe every address in `space` and apply the results
    ///
    /// Probes run concurrently, each bounded by the probe timeout. Results
    /// are applied once all probes have finished.
    pub async fn refresh_space(&self, space: &AddressSpace) -> RefreshReport {
        let _guard = self.refresh_lock.lock().await;
        let start = Instant::now();
        let candidates = space.candidates();

        tracing::debug!(
            backend = self.backend.name(),
            candidates = candidates.len(),
            "Discovery refresh started"
        );

        let results = join_all(candidates.iter().map(|c| self.probe(&c.id))).await;

        let mut report = RefreshReport {
            version: 0,
            probed: candidates.len(),
            discovered: Vec::new(),
            came_up: Vec::new(),
            failures: Vec::new(),
            evicted: Vec::new(),
            promoted: Vec::new(),
            healthy: 0,
            known: 0,
            elapsed: Duration::ZERO,
        };

        for (target, result) in candidates.iter().zip(results) {
            match result {
                Ok(found) => {
                    self.metrics.record_probe(&target.id, true);
                    let transition = self.registry.record_probe_success(
                        &target.id,
                        target.locality,
                        target.gpu_count,
                        found.models,
                        found.warm,
                    );
                    if matches!(
                        transition,
                        ProbeTransition::Inserted | ProbeTransition::Recovered { .. }
                    ) {
                        report.came_up.push(target.id.clone());
                    }
                    report.discovered.push(target.id.clone());
                    report.promoted.extend(found.promoted);
                }
                Err(error) => {
                    self.metrics.record_probe(&target.id, false);
                    let reason = error.to_string();
                    let transition = self.registry.record_probe_failure(&target.id, &reason);
                    let failure = ProbeFailure {
                        instance: target.id.clone(),
                        error: reason,
                        known: transition != ProbeTransition::Absent,
                    };
                    match transition {
                        ProbeTransition::Absent => {
                            tracing::debug!(
                                instance = %target.id,
                                error = %failure.error,
                                "{failure}"
                            );
                        }
                        ProbeTransition::Evicted { .. } => {
                            self.metrics.record_eviction();
                            report.evicted.push(target.id.clone());
                        }
                        _ => {}
                    }
                    report.failures.push(failure);
                }
            }
        }

        self.registry.mark_refreshed();
        report.version = self.registry.version();
        report.known = self.registry.len();
        report.healthy = self.registry.healthy_count();
        report.elapsed = start.elapsed();

        if self
            .metrics
            .record_fleet(report.known, report.healthy, report.elapsed)
        {
            tracing::warn!(known = report.known, "All instances lost");
        } else if report.fleet_lost() {
            tracing::debug!(probed = report.probed, "No healthy instances");
        }

        tracing::debug!(
            version = report.version,
            healthy = report.healthy,
            known = report.known,
            failures = report.failures.len(),
            evicted = report.evicted.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Discovery refresh complete"
        );
        report
    }

    /// Probe one address
    ///
    /// Both backend calls share one `probe_timeout`; the running-model list
    /// only gets what the model list left over.
    async fn probe(&self, id: &InstanceId) -> Result<ProbeResult, BackendError> {
        let timeout = self.config.probe_timeout;
        let started = Instant::now();

        let advertised = tokio::time::timeout(timeout, self.backend.list_models(id, timeout))
            .await
            .map_err(|_| BackendError::Timeout(timeout))??;

        let remaining = timeout.saturating_sub(started.elapsed());
        let warm = match tokio::time::timeout(remaining, self.backend.running_models(id, remaining))
            .await
        {
            Ok(Ok(names)) => names.into_iter().collect(),
            Ok(Err(e)) => {
                tracing::debug!(instance = %id, error = %e, "Running-model list unavailable");
                BTreeSet::new()
            }
            Err(_) => {
                tracing::debug!(instance = %id, "Running-model list timed out");
                BTreeSet::new()
            }
        };

        let mut models = BTreeSet::new();
        let mut promoted = Vec::new();
        for model in advertised {
            let (_, learned) = self.capabilities.promote(&model.name, model.size_gb);
            if learned {
                self.metrics.models_promoted.inc();
                promoted.push(model.name.clone());
            }
            models.insert(model.name);
        }

        Ok(ProbeResult {
            models,
            warm,
            promoted,
        })
    }

    /// Start refreshing on the configured interval
    ///
    /// The first refresh runs immediately.
    pub fn spawn_periodic(self: Arc<Self>) -> DiscoveryHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.interval.max(MIN_INTERVAL);

        let task = tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "Discovery loop started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.refresh().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Discovery loop stopped");
        });

        DiscoveryHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

impl fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Background Handle
// ============================================================================

/// Handle to a running discovery loop
#[derive(Debug)]
pub struct DiscoveryHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    /// Whether the loop is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for it to exit
    ///
    /// A refresh in progress completes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Discovery loop ended abnormally");
        }
    }
}
