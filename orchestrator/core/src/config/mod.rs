//! TOML Configuration File Support
//!
//! Centralized configuration loading for the orchestrator, supporting a TOML
//! configuration file at `~/.config/ollama-master/orchestrator.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`ORCHESTRATOR_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/ollama-master/orchestrator.toml` (typically
//!   `~/.config/ollama-master/orchestrator.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [discovery]
//! interval_secs = 30
//! probe_timeout_ms = 2000
//! eviction_threshold = 3
//! staleness_ttl_secs = 30
//!
//! [[discovery.targets]]
//! host = "localhost"
//! ports = "11434-11437"
//! locality = "local"
//! gpu_count = 1
//!
//! [[discovery.targets]]
//! host = "192.168.0.224"
//! ports = "11434"
//! locality = "remote"
//!
//! [capability]
//! fast_max_gb = 3.0
//! balanced_max_gb = 10.0
//! fast_latency_secs = [0.5, 5.0]
//!
//! [[capability.models]]
//! id = "deepseek-coder:6.7b"
//! size_gb = 3.8
//! tags = ["code"]
//!
//! [routing]
//! locality_weight = 0.5
//! fast_tier_locality_multiplier = 2.0
//! load_weight = 1.0
//! latency_weight = 0.01
//! warm_model_bonus = 0.1
//! infer_tier_from_prompt = false
//!
//! [dispatch]
//! retry_budget = 1
//! grace_factor = 2.0
//! load_decay = 0.3
//! default_deadline_secs = 120
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::{
    CapabilityConfig, CatalogueEntry, LatencyEnvelope, Tier, MAX_ENVELOPE_SECS,
};
use crate::discovery::{AddressSpace, DiscoveryConfig, DiscoveryTarget, PortRange, DEFAULT_PORT};
use crate::dispatch::DispatchConfig;
use crate::routing::RoutingConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// One `[[discovery.targets]]` entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetToml {
    /// Hostname or IP
    pub host: String,
    /// `"11434"` or `"11434-11437"`
    pub ports: Option<String>,
    /// `local` or `remote`
    pub locality: Option<String>,
    /// GPUs behind each instance
    pub gpu_count: Option<u32>,
}

/// Discovery section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryToml {
    /// Background refresh interval in seconds
    pub interval_secs: Option<u64>,

    /// Per-probe timeout in milliseconds
    pub probe_timeout_ms: Option<u64>,

    /// Consecutive failed probes before eviction
    pub eviction_threshold: Option<u32>,

    /// Registry age in seconds that forces a refresh before routing
    pub staleness_ttl_secs: Option<u64>,

    /// Address space; replaces the default when present
    pub targets: Option<Vec<TargetToml>>,
}

/// One `[[capability.models]]` entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelToml {
    /// Model identifier
    pub id: String,
    /// Size in GB
    pub size_gb: f64,
    /// Task tags
    pub tags: Vec<String>,
    /// Tier override
    pub tier: Option<String>,
}

/// Capability section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityToml {
    /// Models below this size are `fast`
    pub fast_max_gb: Option<f64>,

    /// Models up to this size are `balanced`
    pub balanced_max_gb: Option<f64>,

    /// `[min, max]` seconds for the fast tier
    pub fast_latency_secs: Option<[f64; 2]>,

    /// `[min, max]` seconds for the balanced tier
    pub balanced_latency_secs: Option<[f64; 2]>,

    /// `[min, max]` seconds for the powerful tier
    pub powerful_latency_secs: Option<[f64; 2]>,

    /// Catalogue additions; entries replace built-ins with the same id
    pub models: Option<Vec<ModelToml>>,
}

/// Routing section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    /// Bonus for local instances
    pub locality_weight: Option<f64>,

    /// Locality bonus multiplier for fast-tier requests
    pub fast_tier_locality_multiplier: Option<f64>,

    /// Penalty per unit of load
    pub load_weight: Option<f64>,

    /// Penalty per second of latency mismatch
    pub latency_weight: Option<f64>,

    /// Bonus for models already in memory
    pub warm_model_bonus: Option<f64>,

    /// Guess a tier from prompt length
    pub infer_tier_from_prompt: Option<bool>,

    /// Runner-up candidates listed in rationales
    pub rationale_top_n: Option<usize>,
}

/// Dispatch section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    /// Re-routes allowed after a failed attempt
    pub retry_budget: Option<u32>,

    /// Attempt timeout as a multiple of the estimated latency
    pub grace_factor: Option<f64>,

    /// EMA weight of a new load sample
    pub load_decay: Option<f64>,

    /// Deadline in seconds when the caller gives none
    pub default_deadline_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorToml {
    /// Discovery configuration section
    pub discovery: DiscoveryToml,

    /// Capability configuration section
    pub capability: CapabilityToml,

    /// Routing configuration section
    pub routing: RoutingToml,

    /// Dispatch configuration section
    pub dispatch: DispatchToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the orchestrator
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug, Default)]
pub struct OrchestratorConfig {
    /// Discovery Engine configuration
    pub discovery: DiscoveryConfig,

    /// Capability Model configuration
    pub capability: CapabilityConfig,

    /// Routing Engine configuration
    pub routing: RoutingConfig,

    /// Dispatcher configuration
    pub dispatch: DispatchConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl OrchestratorConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first
    /// violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        let b = self.capability.boundaries;
        if b.fast_max_gb <= 0.0 || b.fast_max_gb >= b.balanced_max_gb {
            return invalid(format!(
                "tier boundaries must satisfy 0 < fast_max_gb ({}) < balanced_max_gb ({})",
                b.fast_max_gb, b.balanced_max_gb
            ));
        }
        if self.discovery.eviction_threshold == 0 {
            return invalid("eviction_threshold must be at least 1".to_string());
        }
        if self.discovery.probe_timeout.is_zero() {
            return invalid("probe_timeout_ms must be positive".to_string());
        }
        if self.discovery.interval.is_zero() {
            return invalid("interval_secs must be positive".to_string());
        }
        if self.discovery.address_space.is_empty() {
            return invalid("address space has no targets".to_string());
        }
        if let Some(t) = self
            .discovery
            .address_space
            .targets
            .iter()
            .find(|t| t.host.trim().is_empty())
        {
            return invalid(format!("target with ports {} has no host", t.ports));
        }
        let decay = self.dispatch.load_decay;
        if decay <= 0.0 || decay > 1.0 || decay.is_nan() {
            return invalid(format!("load_decay must be in (0, 1], got {decay}"));
        }
        for tier in Tier::ALL {
            let envelope = self.capability.latencies.envelope(tier);
            if !envelope.is_valid() {
                return invalid(format!(
                    "{tier}_latency_secs must satisfy 0 <= min <= max <= {MAX_ENVELOPE_SECS} \
                     with max > 0, got [{}, {}]",
                    envelope.min_secs, envelope.max_secs
                ));
            }
        }
        if !(self.dispatch.grace_factor.is_finite() && self.dispatch.grace_factor >= 1.0) {
            return invalid(format!(
                "grace_factor must be at least 1, got {}",
                self.dispatch.grace_factor
            ));
        }
        if self.dispatch.default_deadline.is_zero() {
            return invalid("default_deadline_secs must be positive".to_string());
        }
        for entry in &self.capability.catalogue {
            if entry.id.trim().is_empty() {
                return invalid("catalogue entry with empty id".to_string());
            }
            if entry.size_gb < 0.0 || entry.size_gb.is_nan() {
                return invalid(format!("model {} has negative size", entry.id));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/ollama-master/orchestrator.toml` or
/// `~/.config/ollama-master/orchestrator.toml` if `XDG_CONFIG_HOME` is not
/// set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ollama-master").join("orchestrator.toml"))
}

/// Load configuration from all sources with proper priority
///
/// Priority order (highest first):
/// 1. CLI arguments (not handled here - caller should apply after)
/// 2. Environment variables
/// 3. TOML configuration file
/// 4. Default values
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting configuration is invalid. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<OrchestratorConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the resulting configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<OrchestratorConfig, ConfigError> {
    let mut config = OrchestratorConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: OrchestratorToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

fn parse_target(t: &TargetToml) -> Result<DiscoveryTarget, ConfigError> {
    let ports = match t.ports {
        Some(ref ports) => ports
            .parse::<PortRange>()
            .map_err(ConfigError::ValidationError)?,
        None => PortRange::single(DEFAULT_PORT),
    };
    let mut target = DiscoveryTarget::new(t.host.trim(), ports);
    if let Some(ref locality) = t.locality {
        target.locality = locality.parse().map_err(ConfigError::ValidationError)?;
    }
    if let Some(gpus) = t.gpu_count {
        target.gpu_count = gpus;
    }
    Ok(target)
}

fn parse_model(m: &ModelToml) -> Result<CatalogueEntry, ConfigError> {
    let mut entry = CatalogueEntry {
        id: m.id.clone(),
        size_gb: m.size_gb,
        tags: m.tags.clone(),
        tier: None,
    };
    if let Some(ref tier) = m.tier {
        entry = entry.with_tier(
            tier.parse::<Tier>()
                .map_err(|e| ConfigError::ValidationError(format!("model {}: {e}", m.id)))?,
        );
    }
    Ok(entry)
}

fn envelope(pair: [f64; 2]) -> LatencyEnvelope {
    LatencyEnvelope::new(pair[0], pair[1])
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(
    config: &mut OrchestratorConfig,
    toml: &OrchestratorToml,
) -> Result<(), ConfigError> {
    // Discovery settings
    if let Some(secs) = toml.discovery.interval_secs {
        config.discovery.interval = Duration::from_secs(secs);
    }
    if let Some(ms) = toml.discovery.probe_timeout_ms {
        config.discovery.probe_timeout = Duration::from_millis(ms);
    }
    if let Some(threshold) = toml.discovery.eviction_threshold {
        config.discovery.eviction_threshold = threshold;
    }
    if let Some(secs) = toml.discovery.staleness_ttl_secs {
        config.discovery.staleness_ttl = Duration::from_secs(secs);
    }
    if let Some(ref targets) = toml.discovery.targets {
        let targets = targets
            .iter()
            .map(parse_target)
            .collect::<Result<Vec<_>, _>>()?;
        config.discovery.address_space = AddressSpace::new(targets);
    }

    // Capability settings
    if let Some(gb) = toml.capability.fast_max_gb {
        config.capability.boundaries.fast_max_gb = gb;
    }
    if let Some(gb) = toml.capability.balanced_max_gb {
        config.capability.boundaries.balanced_max_gb = gb;
    }
    if let Some(pair) = toml.capability.fast_latency_secs {
        config.capability.latencies.fast = envelope(pair);
    }
    if let Some(pair) = toml.capability.balanced_latency_secs {
        config.capability.latencies.balanced = envelope(pair);
    }
    if let Some(pair) = toml.capability.powerful_latency_secs {
        config.capability.latencies.powerful = envelope(pair);
    }
    if let Some(ref models) = toml.capability.models {
        for model in models {
            let entry = parse_model(model)?;
            config.capability.catalogue.retain(|e| e.id != entry.id);
            config.capability.catalogue.push(entry);
        }
    }

    // Routing settings
    let weights = &mut config.routing.weights;
    if let Some(w) = toml.routing.locality_weight {
        weights.locality_weight = w;
    }
    if let Some(m) = toml.routing.fast_tier_locality_multiplier {
        weights.fast_tier_locality_multiplier = m;
    }
    if let Some(w) = toml.routing.load_weight {
        weights.load_weight = w;
    }
    if let Some(w) = toml.routing.latency_weight {
        weights.latency_weight = w;
    }
    if let Some(b) = toml.routing.warm_model_bonus {
        weights.warm_model_bonus = b;
    }
    if let Some(infer) = toml.routing.infer_tier_from_prompt {
        config.routing.infer_tier_from_prompt = infer;
    }
    if let Some(n) = toml.routing.rationale_top_n {
        config.routing.rationale_top_n = n;
    }

    // Dispatch settings
    if let Some(budget) = toml.dispatch.retry_budget {
        config.dispatch.retry_budget = budget;
    }
    if let Some(grace) = toml.dispatch.grace_factor {
        config.dispatch.grace_factor = grace;
    }
    if let Some(decay) = toml.dispatch.load_decay {
        config.dispatch.load_decay = decay;
    }
    if let Some(secs) = toml.dispatch.default_deadline_secs {
        config.dispatch.default_deadline = Duration::from_secs(secs);
    }

    Ok(())
}

/// Parse `ORCHESTRATOR_TARGETS`: comma-separated `host:ports[/locality[/gpus]]`
///
/// # Errors
///
/// Returns the first target that fails to parse.
pub fn parse_targets(value: &str) -> Result<Vec<DiscoveryTarget>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut OrchestratorConfig) {
    apply_env_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides from any key/value lookup
fn apply_env_from(config: &mut OrchestratorConfig, var: impl Fn(&str) -> Option<String>) {
    // Discovery settings from environment
    if let Some(targets) = var("ORCHESTRATOR_TARGETS") {
        match parse_targets(&targets) {
            Ok(targets) if !targets.is_empty() => {
                config.discovery.address_space = AddressSpace::new(targets);
                config.source = ConfigSource::Env;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Ignoring ORCHESTRATOR_TARGETS"),
        }
    }
    if let Some(secs) = var("ORCHESTRATOR_DISCOVERY_INTERVAL").and_then(|v| v.parse().ok()) {
        config.discovery.interval = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = var("ORCHESTRATOR_PROBE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.discovery.probe_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = var("ORCHESTRATOR_EVICTION_THRESHOLD").and_then(|v| v.parse().ok()) {
        config.discovery.eviction_threshold = n;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = var("ORCHESTRATOR_STALENESS_TTL").and_then(|v| v.parse().ok()) {
        config.discovery.staleness_ttl = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }

    // Capability settings from environment
    if let Some(gb) = var("ORCHESTRATOR_FAST_MAX_GB").and_then(|v| v.parse().ok()) {
        config.capability.boundaries.fast_max_gb = gb;
        config.source = ConfigSource::Env;
    }
    if let Some(gb) = var("ORCHESTRATOR_BALANCED_MAX_GB").and_then(|v| v.parse().ok()) {
        config.capability.boundaries.balanced_max_gb = gb;
        config.source = ConfigSource::Env;
    }

    // Routing settings from environment
    if let Some(w) = var("ORCHESTRATOR_LOCALITY_WEIGHT").and_then(|v| v.parse().ok()) {
        config.routing.weights.locality_weight = w;
        config.source = ConfigSource::Env;
    }
    if let Some(infer) = var("ORCHESTRATOR_INFER_TIER") {
        config.routing.infer_tier_from_prompt = infer != "0" && infer.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }

    // Dispatch settings from environment
    if let Some(n) = var("ORCHESTRATOR_RETRY_BUDGET").and_then(|v| v.parse().ok()) {
        config.dispatch.retry_budget = n;
        config.source = ConfigSource::Env;
    }
    if let Some(g) = var("ORCHESTRATOR_GRACE_FACTOR").and_then(|v| v.parse().ok()) {
        config.dispatch.grace_factor = g;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides,
/// then call [`OrchestratorConfig::validate`].
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Address space override
    pub targets: Option<Vec<DiscoveryTarget>>,

    /// Probe timeout override (milliseconds)
    pub probe_timeout_ms: Option<u64>,

    /// Eviction threshold override
    pub eviction_threshold: Option<u32>,

    /// Locality weight override
    pub locality_weight: Option<f64>,

    /// Prompt-length tier inference override
    pub infer_tier_from_prompt: Option<bool>,

    /// Retry budget override
    pub retry_budget: Option<u32>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set address space override
    #[must_use]
    pub fn with_targets(mut self, targets: Vec<DiscoveryTarget>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Set probe timeout override
    #[must_use]
    pub fn with_probe_timeout_ms(mut self, ms: u64) -> Self {
        self.probe_timeout_ms = Some(ms);
        self
    }

    /// Set eviction threshold override
    #[must_use]
    pub fn with_eviction_threshold(mut self, threshold: u32) -> Self {
        self.eviction_threshold = Some(threshold);
        self
    }

    /// Set locality weight override
    #[must_use]
    pub fn with_locality_weight(mut self, weight: f64) -> Self {
        self.locality_weight = Some(weight);
        self
    }

    /// Set tier inference override
    #[must_use]
    pub fn with_infer_tier_from_prompt(mut self, infer: bool) -> Self {
        self.infer_tier_from_prompt = Some(infer);
        self
    }

    /// Set retry budget override
    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut OrchestratorConfig) {
        if self.targets.as_ref().is_some_and(|t| !t.is_empty())
            || self.probe_timeout_ms.is_some()
            || self.eviction_threshold.is_some()
            || self.locality_weight.is_some()
            || self.infer_tier_from_prompt.is_some()
            || self.retry_budget.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref targets) = self.targets {
            if !targets.is_empty() {
                config.discovery.address_space = AddressSpace::new(targets.clone());
            }
        }

        if let Some(ms) = self.probe_timeout_ms {
            config.discovery.probe_timeout = Duration::from_millis(ms);
        }

        if let Some(threshold) = self.eviction_threshold {
            config.discovery.eviction_threshold = threshold;
        }

        if let Some(weight) = self.locality_weight {
            config.routing.weights.locality_weight = weight;
        }

        if let Some(infer) = self.infer_tier_from_prompt {
            config.routing.infer_tier_from_prompt = infer;
        }

        if let Some(budget) = self.retry_budget {
            config.dispatch.retry_budget = budget;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
