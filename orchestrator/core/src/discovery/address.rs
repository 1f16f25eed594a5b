//! Address space to probe
//!
//! Discovery never scans a network; it walks a finite list of targets, each a
//! host plus an inclusive port range.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::registry::{InstanceId, Locality};

/// Default Ollama port
pub const DEFAULT_PORT: u16 = 11434;

// ============================================================================
// Port Range
// ============================================================================

/// Inclusive port range
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port
    pub start: u16,
    /// Last port (inclusive)
    pub end: u16,
}

impl PortRange {
    /// A range covering `start..=end`
    ///
    /// Bounds given in the wrong order are swapped.
    #[must_use]
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    /// A range covering one port
    #[must_use]
    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    /// Ports in the range
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    /// Number of ports
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    /// Parses `"11434"` or `"11434-11437"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid port '{}': {e}", p.trim()))
        };
        match s.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(format!("empty port range '{s}'"));
                }
                Ok(Self::new(start, end))
            }
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

// ============================================================================
// Targets
// ============================================================================

/// One host to probe over a port range
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryTarget {
    /// Hostname or IP address
    pub host: String,
    /// Ports to probe
    pub ports: PortRange,
    /// Locality assigned to instances found here
    pub locality: Locality,
    /// GPUs behind each instance found here
    pub gpu_count: u32,
}

impl DiscoveryTarget {
    /// A target with locality guessed from the host name and one GPU
    pub fn new(host: impl Into<String>, ports: PortRange) -> Self {
        let host = host.into();
        let locality = default_locality(&host);
        Self {
            host,
            ports,
            locality,
            gpu_count: 1,
        }
    }

    /// Set locality
    #[must_use]
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    /// Set GPU count
    #[must_use]
    pub fn with_gpu_count(mut self, gpu_count: u32) -> Self {
        self.gpu_count = gpu_count;
        self
    }
}

/// Loopback hosts are local; everything else is assumed remote
#[must_use]
pub fn default_locality(host: &str) -> Locality {
    match host {
        "localhost" | "127.0.0.1" | "::1" => Locality::Local,
        _ => Locality::Remote,
    }
}

impl FromStr for DiscoveryTarget {
    type Err = String;

    /// Parses `host:ports[/locality[/gpus]]`, e.g.
    /// `localhost:11434-11437/local/2` or `gpu-box:11434/remote`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('/');
        let address = parts.next().unwrap_or_default();
        let (host, ports) = match address.rsplit_once(':') {
            Some((host, ports)) => (host, ports.parse::<PortRange>()?),
            None => (address, PortRange::single(DEFAULT_PORT)),
        };
        if host.is_empty() {
            return Err(format!("missing host in target '{s}'"));
        }

        let mut target = Self::new(host, ports);
        if let Some(locality) = parts.next().filter(|p| !p.is_empty()) {
            target.locality = locality.parse()?;
        }
        if let Some(gpus) = parts.next().filter(|p| !p.is_empty()) {
            target.gpu_count = gpus
                .parse()
                .map_err(|e| format!("invalid gpu count '{gpus}': {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("too many fields in target '{s}'"));
        }
        Ok(target)
    }
}

// ============================================================================
// Address Space
// ============================================================================

/// One concrete address to probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Instance identity
    pub id: InstanceId,
    /// Locality to record
    pub locality: Locality,
    /// GPU count to record
    pub gpu_count: u32,
}

/// Finite set of addresses discovery walks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpace {
    /// Targets in configuration order
    pub targets: Vec<DiscoveryTarget>,
}

impl AddressSpace {
    /// An address space over the given targets
    #[must_use]
    pub fn new(targets: Vec<DiscoveryTarget>) -> Self {
        Self { targets }
    }

    /// Add a target
    #[must_use]
    pub fn with_target(mut self, target: DiscoveryTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// Every (host, port) to probe
    ///
    /// When targets overlap the first one listed decides locality and GPU
    /// count.
    #[must_use]
    pub fn candidates(&self) -> Vec<ProbeTarget> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for target in &self.targets {
            for port in target.ports.ports() {
                let id = InstanceId::new(target.host.clone(), port);
                if seen.insert(id.clone()) {
                    out.push(ProbeTarget {
                        id,
                        locality: target.locality,
                        gpu_count: target.gpu_count,
                    });
                }
            }
        }
        out
    }

    /// Number of distinct addresses
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates().len()
    }

    /// Whether there is nothing to probe
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Default for AddressSpace {
    /// Four local instances on the default Ollama ports
    fn default() -> Self {
        Self::new(vec![DiscoveryTarget::new(
            "localhost",
            PortRange::new(DEFAULT_PORT, DEFAULT_PORT + 3),
        )])
    }
}
