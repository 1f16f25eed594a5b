//! Orchestrator Metrics
//!
//! Observability for discovery, routing and dispatch:
//! - Probe counts, probe failures and evictions
//! - Fleet size and total fleet loss
//! - Routing decisions, rejections per reason, decision time
//! - Dispatch attempts, retries, terminal failures, latency
//! - Per-instance request outcomes
//!
//! Transient failures never surface as errors to callers; this module is
//! where they become visible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::registry::InstanceId;
use crate::routing::Infeasibility;

// ============================================================================
// Histogram
// ============================================================================

/// A histogram for tracking value distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket boundaries (in the unit being measured)
    buckets: Vec<f64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    /// Total count
    total_count: AtomicU64,
    /// Sum of all values
    sum: AtomicU64,
    /// Minimum value seen
    min: AtomicU64,
    /// Maximum value seen
    max: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with the given bucket boundaries
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets (milliseconds)
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);

        // Not perfectly atomic with the counts, good enough for metrics
        let value_u64 = value as u64;
        self.min.fetch_min(value_u64, Ordering::Relaxed);
        self.max.fetch_max(value_u64, Ordering::Relaxed);
    }

    /// Get histogram snapshot
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max,
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds
    pub buckets: Vec<f64>,
    /// Count per bucket
    pub counts: Vec<u64>,
    /// Values recorded
    pub total: u64,
    /// Sum of recorded values
    pub sum: u64,
    /// Smallest value, 0 when empty
    pub min: u64,
    /// Largest value
    pub max: u64,
    /// Mean of recorded values
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bucket bound containing the `p` quantile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        *self.buckets.last().unwrap_or(&0.0)
    }

    /// Median bucket bound
    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// 99th percentile bucket bound
    #[must_use]
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Counter at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Gauge
// ============================================================================

/// A gauge (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Gauge at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the value
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Instance Metrics
// ============================================================================

/// Metrics for a single instance
#[derive(Debug)]
pub struct InstanceMetrics {
    /// Instance these metrics belong to
    pub instance: InstanceId,
    /// Generate calls sent
    pub dispatches: Counter,
    /// Generate calls answered
    pub successes: Counter,
    /// Attempts that timed out
    pub timeouts: Counter,
    /// Attempts that failed to connect or lost the connection
    pub transport_errors: Counter,
    /// Attempts answered with an error status or bad body
    pub status_errors: Counter,
    /// Failed discovery probes
    pub probe_failures: Counter,
    /// Successful response time in milliseconds
    pub response_time: Histogram,
}

impl InstanceMetrics {
    /// Empty metrics for `instance`
    #[must_use]
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            dispatches: Counter::new(),
            successes: Counter::new(),
            timeouts: Counter::new(),
            transport_errors: Counter::new(),
            status_errors: Counter::new(),
            probe_failures: Counter::new(),
            response_time: Histogram::latency_default(),
        }
    }

    /// Failed dispatches over all dispatches
    pub fn error_rate(&self) -> f64 {
        let total = self.dispatches.get();
        if total == 0 {
            return 0.0;
        }
        let failed =
            self.timeouts.get() + self.transport_errors.get() + self.status_errors.get();
        failed as f64 / total as f64
    }

    /// Point-in-time summary
    #[must_use]
    pub fn summary(&self) -> InstanceMetricsSummary {
        let response_time = self.response_time.snapshot();
        InstanceMetricsSummary {
            instance: self.instance.clone(),
            dispatches: self.dispatches.get(),
            successes: self.successes.get(),
            timeouts: self.timeouts.get(),
            transport_errors: self.transport_errors.get(),
            status_errors: self.status_errors.get(),
            probe_failures: self.probe_failures.get(),
            error_rate: self.error_rate(),
            response_time_p50_ms: response_time.p50(),
            response_time_p99_ms: response_time.p99(),
        }
    }
}

/// Summary of instance metrics
#[derive(Clone, Debug)]
pub struct InstanceMetricsSummary {
    /// Instance
    pub instance: InstanceId,
    /// Generate calls sent
    pub dispatches: u64,
    /// Generate calls answered
    pub successes: u64,
    /// Timed-out attempts
    pub timeouts: u64,
    /// Transport failures
    pub transport_errors: u64,
    /// Error-status or decode failures
    pub status_errors: u64,
    /// Failed probes
    pub probe_failures: u64,
    /// Failed dispatches over all dispatches
    pub error_rate: f64,
    /// Median response time
    pub response_time_p50_ms: f64,
    /// 99th percentile response time
    pub response_time_p99_ms: f64,
}

/// Kind of failed dispatch attempt, for per-instance counters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptFailureKind {
    /// No answer within the attempt timeout
    Timeout,
    /// Connection refused or reset
    Transport,
    /// Error status or undecodable body
    Status,
}

// ============================================================================
// Orchestrator Metrics
// ============================================================================

/// Centralized metrics for the orchestrator
pub struct OrchestratorMetrics {
    instances: DashMap<InstanceId, Arc<InstanceMetrics>>,

    // Discovery
    /// Discovery refreshes run
    pub refreshes: Counter,
    /// Probes issued
    pub probes: Counter,
    /// Probes that failed
    pub probe_failures: Counter,
    /// Instances evicted
    pub evictions: Counter,
    /// Unknown models learned from probes
    pub models_promoted: Counter,
    /// Instances in the registry
    pub instances_known: Gauge,
    /// Healthy instances
    pub instances_healthy: Gauge,
    /// 1 while no instance is healthy
    pub fleet_lost: Gauge,
    /// Refresh duration in milliseconds
    pub refresh_time: Histogram,

    // Routing
    /// Successful routing decisions
    pub routing_decisions: Counter,
    /// Candidate pairs rejected
    pub rejected_candidates: Counter,
    /// Requests no model could serve
    pub no_capable_model: Counter,
    /// Requests whose capable instances were all unusable
    pub no_healthy_instance: Counter,
    /// Requests over their latency budget
    pub budget_exceeded: Counter,
    /// Microseconds
    pub routing_decision_time: Histogram,

    // Dispatch
    /// Generate calls sent
    pub dispatch_attempts: Counter,
    /// Re-routes after a failed attempt
    pub dispatch_retries: Counter,
    /// Requests answered
    pub dispatch_successes: Counter,
    /// Requests that failed terminally
    pub dispatch_failures: Counter,
    /// Successful attempt latency in milliseconds
    pub dispatch_latency: Histogram,

    // Workflows
    /// Workflow runs started
    pub workflow_runs: Counter,
    /// Workflow runs stopped by a failed step
    pub workflow_failures: Counter,

    started_at: Instant,
}

impl OrchestratorMetrics {
    /// All metrics at zero
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            refreshes: Counter::new(),
            probes: Counter::new(),
            probe_failures: Counter::new(),
            evictions: Counter::new(),
            models_promoted: Counter::new(),
            instances_known: Gauge::new(),
            instances_healthy: Gauge::new(),
            fleet_lost: Gauge::new(),
            refresh_time: Histogram::latency_default(),
            routing_decisions: Counter::new(),
            rejected_candidates: Counter::new(),
            no_capable_model: Counter::new(),
            no_healthy_instance: Counter::new(),
            budget_exceeded: Counter::new(),
            routing_decision_time: Histogram::new(vec![
                10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 10000.0,
            ]),
            dispatch_attempts: Counter::new(),
            dispatch_retries: Counter::new(),
            dispatch_successes: Counter::new(),
            dispatch_failures: Counter::new(),
            dispatch_latency: Histogram::latency_default(),
            workflow_runs: Counter::new(),
            workflow_failures: Counter::new(),
            started_at: Instant::now(),
        }
    }

    /// Get or create metrics for an instance
    pub fn instance(&self, id: &InstanceId) -> Arc<InstanceMetrics> {
        if let Some(metrics) = self.instances.get(id) {
            return Arc::clone(&metrics);
        }
        self.instances
            .entry(id.clone())
            .or_insert_with(|| Arc::new(InstanceMetrics::new(id.clone())))
            .clone()
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Count a probe and its outcome
    pub fn record_probe(&self, id: &InstanceId, success: bool) {
        self.probes.inc();
        if !success {
            self.probe_failures.inc();
            self.instance(id).probe_failures.inc();
        }
    }

    /// Count an eviction
    pub fn record_eviction(&self) {
        self.evictions.inc();
    }

    /// Update fleet gauges after a refresh
    ///
    /// Returns `true` if this refresh lost the whole fleet (healthy count
    /// dropped to zero from a non-zero value).
    pub fn record_fleet(&self, known: usize, healthy: usize, elapsed: Duration) -> bool {
        self.refreshes.inc();
        self.refresh_time.record(elapsed.as_millis() as f64);
        self.instances_known.set(known as u64);
        let was_healthy = self.instances_healthy.get();
        self.instances_healthy.set(healthy as u64);
        let lost = healthy == 0;
        self.fleet_lost.set(u64::from(lost));
        lost && was_healthy > 0
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    /// Count a routing decision and its rejections
    pub fn record_decision(&self, elapsed: Duration, rejected: usize) {
        self.routing_decisions.inc();
        self.rejected_candidates.add(rejected as u64);
        self.routing_decision_time
            .record(elapsed.as_micros() as f64);
    }

    /// Count an infeasible request by reason
    pub fn record_infeasible(&self, reason: &Infeasibility, elapsed: Duration) {
        self.routing_decision_time
            .record(elapsed.as_micros() as f64);
        match reason {
            Infeasibility::NoCapableModel { .. } => self.no_capable_model.inc(),
            Infeasibility::NoHealthyInstance { .. } => self.no_healthy_instance.inc(),
            Infeasibility::BudgetExceeded { .. } => self.budget_exceeded.inc(),
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Count a generate call to `id`
    pub fn record_attempt(&self, id: &InstanceId) {
        self.dispatch_attempts.inc();
        self.instance(id).dispatches.inc();
    }

    /// Count an answered attempt and record its latency
    pub fn record_attempt_success(&self, id: &InstanceId, latency: Duration) {
        self.dispatch_successes.inc();
        let ms = latency.as_millis() as f64;
        self.dispatch_latency.record(ms);
        let metrics = self.instance(id);
        metrics.successes.inc();
        metrics.response_time.record(ms);
    }

    /// Count a failed attempt on `id`
    pub fn record_attempt_failure(&self, id: &InstanceId, kind: AttemptFailureKind) {
        let metrics = self.instance(id);
        match kind {
            AttemptFailureKind::Timeout => metrics.timeouts.inc(),
            AttemptFailureKind::Transport => metrics.transport_errors.inc(),
            AttemptFailureKind::Status => metrics.status_errors.inc(),
        }
    }

    /// Count a re-route
    pub fn record_retry(&self) {
        self.dispatch_retries.inc();
    }

    /// Count a terminal dispatch failure
    pub fn record_dispatch_failed(&self) {
        self.dispatch_failures.inc();
    }

    /// Count a finished workflow run
    pub fn record_workflow(&self, succeeded: bool) {
        self.workflow_runs.inc();
        if !succeeded {
            self.workflow_failures.inc();
        }
    }

    // ------------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------------

    /// Time since these metrics were created
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Per-instance summaries, sorted by instance
    pub fn instance_summaries(&self) -> Vec<InstanceMetricsSummary> {
        let mut summaries: Vec<_> = self.instances.iter().map(|m| m.summary()).collect();
        summaries.sort_by(|a, b| a.instance.cmp(&b.instance));
        summaries
    }

    /// Export as Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, &Counter); 15] = [
            ("orchestrator_refreshes_total", "Discovery refreshes", &self.refreshes),
            ("orchestrator_probes_total", "Discovery probes issued", &self.probes),
            (
                "orchestrator_probe_failures_total",
                "Discovery probes that failed",
                &self.probe_failures,
            ),
            ("orchestrator_evictions_total", "Instances evicted", &self.evictions),
            (
                "orchestrator_models_promoted_total",
                "Unknown models promoted into the catalogue",
                &self.models_promoted,
            ),
            (
                "orchestrator_routing_decisions_total",
                "Successful routing decisions",
                &self.routing_decisions,
            ),
            (
                "orchestrator_rejected_candidates_total",
                "Candidates rejected during routing",
                &self.rejected_candidates,
            ),
            (
                "orchestrator_no_capable_model_total",
                "Requests with no capable model",
                &self.no_capable_model,
            ),
            (
                "orchestrator_no_healthy_instance_total",
                "Requests with no healthy instance",
                &self.no_healthy_instance,
            ),
            (
                "orchestrator_budget_exceeded_total",
                "Requests exceeding their latency budget",
                &self.budget_exceeded,
            ),
            ("orchestrator_dispatch_attempts_total", "Dispatch attempts", &self.dispatch_attempts),
            ("orchestrator_dispatch_retries_total", "Dispatch retries", &self.dispatch_retries),
            (
                "orchestrator_dispatch_failures_total",
                "Requests that exhausted their retries",
                &self.dispatch_failures,
            ),
            ("orchestrator_workflow_runs_total", "Workflow runs", &self.workflow_runs),
            (
                "orchestrator_workflow_failures_total",
                "Workflow runs stopped by a failed step",
                &self.workflow_failures,
            ),
        ];
        for (name, help, counter) in counters {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n\n",
                counter.get()
            ));
        }

        let gauges: [(&str, &str, &Gauge); 3] = [
            ("orchestrator_instances_known", "Instances in the registry", &self.instances_known),
            ("orchestrator_instances_healthy", "Healthy instances", &self.instances_healthy),
            ("orchestrator_fleet_lost", "1 when no instance is healthy", &self.fleet_lost),
        ];
        for (name, help, gauge) in gauges {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {}\n\n",
                gauge.get()
            ));
        }

        let routing = self.routing_decision_time.snapshot();
        output.push_str(&format!(
            "# HELP orchestrator_routing_decision_us Routing decision time\n\
             # TYPE orchestrator_routing_decision_us summary\n\
             orchestrator_routing_decision_us{{quantile=\"0.5\"}} {}\n\
             orchestrator_routing_decision_us{{quantile=\"0.99\"}} {}\n\n",
            routing.p50(),
            routing.p99()
        ));

        let summaries = self.instance_summaries();
        if !summaries.is_empty() {
            output.push_str(
                "# HELP instance_dispatches_total Dispatch attempts per instance\n\
                 # TYPE instance_dispatches_total counter\n",
            );
            for s in &summaries {
                output.push_str(&format!(
                    "instance_dispatches_total{{instance=\"{}\"}} {}\n",
                    s.instance, s.dispatches
                ));
            }
            output.push('\n');
            for s in &summaries {
                output.push_str(&format!(
                    "instance_errors_total{{instance=\"{}\",kind=\"timeout\"}} {}\n\
                     instance_errors_total{{instance=\"{}\",kind=\"transport\"}} {}\n\
                     instance_errors_total{{instance=\"{}\",kind=\"status\"}} {}\n\
                     instance_probe_failures_total{{instance=\"{}\"}} {}\n\
                     instance_response_p50_ms{{instance=\"{}\"}} {}\n",
                    s.instance,
                    s.timeouts,
                    s.instance,
                    s.transport_errors,
                    s.instance,
                    s.status_errors,
                    s.instance,
                    s.probe_failures,
                    s.instance,
                    s.response_time_p50_ms,
                ));
            }
        }

        output
    }
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrchestratorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorMetrics")
            .field("instances", &self.instances.len())
            .field("routing_decisions", &self.routing_decisions.get())
            .field("dispatch_attempts", &self.dispatch_attempts.get())
            .finish()
    }
}
