//! Instance records

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Identity
// ============================================================================

/// Identity of a backend instance
///
/// Ordering is host then port; routing tie-breaks rely on it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl InstanceId {
    /// Create an instance identity
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL for HTTP requests
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for InstanceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{s}'"))?;
        if host.is_empty() {
            return Err(format!("missing host in '{s}'"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in '{s}': {e}"))?;
        Ok(Self::new(host, port))
    }
}

// ============================================================================
// Locality and Health
// ============================================================================

/// Whether an instance is reachable without crossing a WAN boundary
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    /// Same host or LAN
    Local,
    /// Across a wide-area boundary
    Remote,
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for Locality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown locality '{other}' (expected local or remote)")),
        }
    }
}

/// Health of an instance as last observed
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not yet probed successfully
    #[default]
    Unknown,
    /// Last probe or dispatch succeeded
    Healthy,
    /// Last probe or dispatch failed
    Unreachable,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

// ============================================================================
// Instance
// ============================================================================

/// One backend inference server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Identity
    pub id: InstanceId,
    /// Local or remote
    pub locality: Locality,
    /// Number of GPUs backing the instance
    pub gpu_count: u32,
    /// Current health
    pub health: HealthState,
    /// Last successful probe (wall clock)
    pub last_seen: Option<DateTime<Utc>>,
    /// Models the instance advertises
    pub models: BTreeSet<String>,
    /// Models currently resident in memory (subset of `models`)
    pub warm_models: BTreeSet<String>,
    /// Exponentially decayed load estimate in [0, 1]
    pub load: f64,
    /// Smoothed observed request latency, in seconds
    pub observed_latency_secs: Option<f64>,
    /// Consecutive failed probes
    pub probe_failures: u32,
    /// Consecutive failed dispatches
    pub dispatch_failures: u32,
}

impl Instance {
    /// A freshly discovered instance
    pub fn new(id: InstanceId, locality: Locality, gpu_count: u32) -> Self {
        Self {
            id,
            locality,
            gpu_count,
            health: HealthState::Unknown,
            last_seen: None,
            models: BTreeSet::new(),
            warm_models: BTreeSet::new(),
            load: 0.0,
            observed_latency_secs: None,
            probe_failures: 0,
            dispatch_failures: 0,
        }
    }

    /// Whether routing may select this instance
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health == HealthState::Healthy
    }

    /// Whether `model` is resident in memory
    #[must_use]
    pub fn is_warm(&self, model: &str) -> bool {
        self.warm_models.contains(model)
    }

    /// The parts of the record that describe the fleet, without bookkeeping
    ///
    /// `last_seen` changes on every successful probe and is excluded, so two
    /// refreshes of an unchanged network compare equal.
    #[must_use]
    pub fn content(&self) -> InstanceContent {
        InstanceContent {
            id: self.id.clone(),
            locality: self.locality,
            gpu_count: self.gpu_count,
            health: self.health,
            models: self.models.clone(),
            warm_models: self.warm_models.clone(),
            load_millis: (self.load * 1000.0).round() as u32,
            probe_failures: self.probe_failures,
        }
    }
}

/// Timestamp-free view of an instance used for content comparisons
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceContent {
    /// Identity
    pub id: InstanceId,
    /// Locality
    pub locality: Locality,
    /// GPU count
    pub gpu_count: u32,
    /// Health
    pub health: HealthState,
    /// Advertised models
    pub models: BTreeSet<String>,
    /// Resident models
    pub warm_models: BTreeSet<String>,
    /// Load in thousandths
    pub load_millis: u32,
    /// Consecutive probe failures
    pub probe_failures: u32,
}
