//! Instance Registry
//!
//! Holds the currently known set of backend instances, their advertised
//! models, and their health/load state.
//!
//! # Ownership
//!
//! ```text
//!   DiscoveryEngine ──probe results──┐
//!                                    v
//!                          +------------------+        snapshot()       +-----------------+
//!                          | InstanceRegistry | ----------------------> | RegistrySnapshot |
//!                          +------------------+   (immutable, versioned) +-----------------+
//!                                    ^                                           |
//!   Dispatcher ──latency / failure───┘                                  RoutingEngine
//! ```
//!
//! Writes go through per-instance `DashMap` entries, so updates to one
//! instance never wait on another and there is no global write lock.
//! Readers only ever see [`RegistrySnapshot`]s, which are owned copies and
//! cannot change underneath a routing decision.

mod instance;
mod snapshot;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::capability::LatencyEnvelope;

pub use instance::{HealthState, Instance, InstanceContent, InstanceId, Locality};
pub use snapshot::RegistrySnapshot;

/// Consecutive failed probes before an instance is evicted
pub const DEFAULT_EVICTION_THRESHOLD: u32 = 3;

/// Default EMA decay applied to load samples
pub const DEFAULT_LOAD_DECAY: f64 = 0.3;

// ============================================================================
// Probe Transitions
// ============================================================================

/// What a probe result did to the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeTransition {
    /// First successful probe of a new instance
    Inserted,
    /// Instance came back from `unknown`/`unreachable`
    Recovered {
        /// Health before the probe
        from: HealthState,
    },
    /// Healthy instance whose model set changed
    Updated,
    /// Healthy instance, nothing changed
    Unchanged,
    /// Known instance failed a probe and is (still) `unreachable`
    Unreachable {
        /// Consecutive failed probes so far
        failures: u32,
    },
    /// Known instance hit the eviction threshold and was removed
    Evicted {
        /// Consecutive failed probes
        failures: u32,
    },
    /// Probe failed for an address that never answered; nothing to record
    Absent,
}

// ============================================================================
// Instance Registry
// ============================================================================

/// Concurrent registry of known instances
pub struct InstanceRegistry {
    instances: DashMap<InstanceId, Instance>,
    version: AtomicU64,
    eviction_threshold: u32,
    last_refresh: Mutex<Option<Instant>>,
    cached: RwLock<Option<Arc<RegistrySnapshot>>>,
}

impl InstanceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(eviction_threshold: u32) -> Self {
        Self {
            instances: DashMap::new(),
            version: AtomicU64::new(0),
            eviction_threshold: eviction_threshold.max(1),
            last_refresh: Mutex::new(None),
            cached: RwLock::new(None),
        }
    }

    /// Consecutive probe failures that trigger eviction
    #[must_use]
    pub fn eviction_threshold(&self) -> u32 {
        self.eviction_threshold
    }

    /// Current content version
    ///
    /// Bumped whenever an instance's content changes; `last_seen` updates
    /// alone do not bump it.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Number of known instances
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Number of instances currently `healthy`
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.instances.iter().filter(|e| e.is_healthy()).count()
    }

    /// Copy of one instance record
    #[must_use]
    pub fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.instances.get(id).map(|e| e.clone())
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------------
    // Discovery writes
    // ------------------------------------------------------------------------

    /// Record a successful probe
    ///
    /// Inserts the instance if new, marks it `healthy`, resets its probe
    /// failure count and replaces its model sets. Warm models not present in
    /// `models` are ignored.
    pub fn record_probe_success(
        &self,
        id: &InstanceId,
        locality: Locality,
        gpu_count: u32,
        models: BTreeSet<String>,
        warm_models: BTreeSet<String>,
    ) -> ProbeTransition {
        let warm_models: BTreeSet<String> = warm_models.intersection(&models).cloned().collect();

        let mut entry = self.instances.entry(id.clone()).or_insert_with(|| {
            let instance = Instance::new(id.clone(), locality, gpu_count);
            tracing::info!(
                instance = %id,
                locality = %locality,
                gpus = gpu_count,
                "Instance discovered"
            );
            instance
        });
        let inserted = entry.last_seen.is_none() && entry.health == HealthState::Unknown;
        let before = entry.content();
        let previous_health = entry.health;

        entry.locality = locality;
        entry.gpu_count = gpu_count;
        entry.health = HealthState::Healthy;
        entry.probe_failures = 0;
        entry.last_seen = Some(Utc::now());
        if entry.models != models {
            tracing::info!(
                instance = %id,
                models = ?models,
                "Instance model set changed"
            );
            entry.models = models;
        }
        entry.warm_models = warm_models;

        let changed = entry.content() != before;
        drop(entry);
        if changed || inserted {
            self.bump();
        }

        if inserted {
            tracing::info!(instance = %id, "Instance unknown -> healthy");
            ProbeTransition::Inserted
        } else if previous_health != HealthState::Healthy {
            tracing::info!(
                instance = %id,
                from = %previous_health,
                "Instance recovered -> healthy"
            );
            ProbeTransition::Recovered {
                from: previous_health,
            }
        } else if changed {
            ProbeTransition::Updated
        } else {
            ProbeTransition::Unchanged
        }
    }

    /// Record a failed probe
    ///
    /// Known instances become `unreachable`; at the eviction threshold they
    /// are removed. Addresses that never answered are left alone.
    pub fn record_probe_failure(&self, id: &InstanceId, reason: &str) -> ProbeTransition {
        let failures = {
            let Some(mut entry) = self.instances.get_mut(id) else {
                return ProbeTransition::Absent;
            };
            entry.probe_failures += 1;
            let failures = entry.probe_failures;
            if failures < self.eviction_threshold {
                let previous = entry.health;
                entry.health = HealthState::Unreachable;
                drop(entry);
                self.bump();
                if previous == HealthState::Unreachable {
                    tracing::debug!(
                        instance = %id,
                        failures,
                        reason,
                        "Instance still unreachable"
                    );
                } else {
                    tracing::warn!(
                        instance = %id,
                        from = %previous,
                        failures,
                        reason,
                        "Instance -> unreachable"
                    );
                }
                return ProbeTransition::Unreachable { failures };
            }
            failures
        };

        self.instances.remove(id);
        self.bump();
        tracing::warn!(
            instance = %id,
            failures,
            threshold = self.eviction_threshold,
            reason,
            "Instance evicted"
        );
        ProbeTransition::Evicted { failures }
    }

    /// Remember when a full refresh completed
    pub fn mark_refreshed(&self) {
        *self.last_refresh.lock() = Some(Instant::now());
    }

    /// Time since the last completed refresh
    #[must_use]
    pub fn since_refresh(&self) -> Option<Duration> {
        self.last_refresh.lock().map(|at| at.elapsed())
    }

    /// Whether the registry has never been refreshed or is older than `ttl`
    #[must_use]
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.since_refresh().map_or(true, |age| age > ttl)
    }

    // ------------------------------------------------------------------------
    // Dispatcher feedback
    // ------------------------------------------------------------------------

    /// Fold an observed request latency into the instance's load estimate
    ///
    /// The sample is where `observed` lands inside the model's latency
    /// envelope (0 = at or under the minimum, 1 = at or over the maximum),
    /// smoothed with an exponential moving average of weight `decay`.
    /// Returns the new load, or `None` if the instance is gone.
    pub fn record_dispatch_success(
        &self,
        id: &InstanceId,
        observed: Duration,
        envelope: &LatencyEnvelope,
        decay: f64,
    ) -> Option<f64> {
        let decay = decay.clamp(0.0, 1.0);
        let observed_secs = observed.as_secs_f64();
        let sample = envelope.position_of(observed_secs);

        let mut entry = self.instances.get_mut(id)?;
        entry.load = (decay * sample + (1.0 - decay) * entry.load).clamp(0.0, 1.0);
        entry.observed_latency_secs = Some(match entry.observed_latency_secs {
            Some(prev) => decay * observed_secs + (1.0 - decay) * prev,
            None => observed_secs,
        });
        entry.dispatch_failures = 0;
        let previous = entry.health;
        entry.health = HealthState::Healthy;
        let load = entry.load;
        drop(entry);
        self.bump();

        if previous != HealthState::Healthy {
            tracing::info!(
                instance = %id,
                from = %previous,
                "Instance -> healthy after successful dispatch"
            );
        }
        tracing::debug!(
            instance = %id,
            observed_ms = observed.as_millis() as u64,
            sample,
            load,
            "Updated instance load"
        );
        Some(load)
    }

    /// Mark an instance `unreachable` after a timeout or transport error
    ///
    /// Returns the instance's consecutive dispatch failure count, or `None`
    /// if the instance is gone.
    pub fn record_dispatch_failure(&self, id: &InstanceId, reason: &str) -> Option<u32> {
        let mut entry = self.instances.get_mut(id)?;
        entry.dispatch_failures += 1;
        let failures = entry.dispatch_failures;
        let previous = entry.health;
        entry.health = HealthState::Unreachable;
        drop(entry);
        self.bump();

        tracing::warn!(
            instance = %id,
            from = %previous,
            failures,
            reason,
            "Instance -> unreachable after failed dispatch"
        );
        Some(failures)
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// Immutable point-in-time copy of the registry
    ///
    /// Repeated calls without intervening content changes share one
    /// allocation. Concurrent callers only take the cache's shared read
    /// lock; the write lock is held briefly after a content change.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let version = self.version();
        {
            let cached = self.cached.read();
            if let Some(snapshot) = cached.as_ref() {
                if snapshot.version() == version {
                    return Arc::clone(snapshot);
                }
            }
        }

        let instances: Vec<Instance> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        let snapshot = Arc::new(RegistrySnapshot::new(version, instances));

        // Only cache if nothing moved while copying
        if self.version() == version {
            let mut cached = self.cached.write();
            if !cached.as_ref().is_some_and(|c| c.version() >= version) {
                *cached = Some(Arc::clone(&snapshot));
            }
        }
        snapshot
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EVICTION_THRESHOLD)
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.instances.len())
            .field("version", &self.version())
            .field("eviction_threshold", &self.eviction_threshold)
            .finish()
    }
}
