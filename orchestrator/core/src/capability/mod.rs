//! Capability Model
//!
//! Answers "what is model M good for, and how big/fast is it?".
//!
//! The model is a static catalogue loaded at startup plus a learned overlay
//! populated at runtime when discovery reports a model the catalogue does not
//! know. Unknown models are promoted, never dropped: their tier comes from the
//! reported size and their tags default to `{general}`.
//!
//! ```text
//!   classify(id, size)
//!         |
//!         v
//!   +-----------+   miss   +---------+   miss   +-------------------+
//!   | catalogue | -------> | learned | -------> | synthesize by size|
//!   +-----------+          +---------+          +-------------------+
//! ```
//!
//! Everything here is pure lookup. No I/O.

mod tier;

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use tier::{
    saturating_secs, LatencyEnvelope, Tier, TierBoundaries, TierLatencies, MAX_ENVELOPE_SECS,
};

/// Tag every model carries when nothing more specific is known
pub const TAG_GENERAL: &str = "general";

// ============================================================================
// Model Capability
// ============================================================================

/// Where a capability entry came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilitySource {
    /// Static catalogue (built-in or configured)
    Catalogue,
    /// Promoted at runtime from a discovery report
    Learned,
}

/// What a model is good for, and how big/fast it is
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelCapability {
    /// Model identifier as advertised by the backend (e.g. `llama3.1:8b`)
    pub model_id: String,
    /// Approximate size in GB
    pub size_gb: f64,
    /// Performance tier
    pub tier: Tier,
    /// Task-category tags (`general`, `code`, `reasoning`, ...)
    pub tags: BTreeSet<String>,
    /// Target latency envelope for this model's tier
    pub latency: LatencyEnvelope,
    /// Catalogue or learned
    pub source: CapabilitySource,
}

impl ModelCapability {
    /// Whether the model's tags intersect `required`
    ///
    /// An empty requirement is satisfied by every model.
    #[must_use]
    pub fn supports(&self, required: &BTreeSet<String>) -> bool {
        required.is_empty() || !self.tags.is_disjoint(required)
    }
}

/// A static catalogue entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogueEntry {
    /// Model identifier
    pub id: String,
    /// Approximate size in GB
    pub size_gb: f64,
    /// Task-category tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Pin a tier instead of deriving it from size
    #[serde(default)]
    pub tier: Option<Tier>,
}

impl CatalogueEntry {
    /// Create an entry whose tier is derived from its size
    pub fn new(id: impl Into<String>, size_gb: f64, tags: &[&str]) -> Self {
        Self {
            id: id.into(),
            size_gb,
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            tier: None,
        }
    }

    /// Pin the tier
    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }
}

/// The models shipped in the built-in catalogue
#[must_use]
pub fn default_catalogue() -> Vec<CatalogueEntry> {
    vec![
        CatalogueEntry::new("phi4", 2.8, &["general"]),
        CatalogueEntry::new("qwen2.5:7b", 4.7, &["general"]),
        CatalogueEntry::new("llama3.1:8b", 8.0, &["general", "analysis"]),
        CatalogueEntry::new("gpt-oss:20b", 20.0, &["reasoning", "function_calling"]),
        CatalogueEntry::new("codellama:33b", 33.0, &["code", "analysis"]),
    ]
}

// ============================================================================
// Configuration
// ============================================================================

/// Capability model configuration
#[derive(Clone, Debug, PartialEq)]
pub struct CapabilityConfig {
    /// Size thresholds for tier classification
    pub boundaries: TierBoundaries,
    /// Latency envelope per tier
    pub latencies: TierLatencies,
    /// Static catalogue
    pub catalogue: Vec<CatalogueEntry>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            boundaries: TierBoundaries::default(),
            latencies: TierLatencies::default(),
            catalogue: default_catalogue(),
        }
    }
}

// ============================================================================
// Capability Model
// ============================================================================

/// Static-plus-learned catalogue of model capabilities
pub struct CapabilityModel {
    boundaries: TierBoundaries,
    latencies: TierLatencies,
    catalogue: BTreeMap<String, ModelCapability>,
    learned: RwLock<BTreeMap<String, ModelCapability>>,
}

impl CapabilityModel {
    /// Build from configuration
    #[must_use]
    pub fn new(config: &CapabilityConfig) -> Self {
        let catalogue = config
            .catalogue
            .iter()
            .map(|entry| {
                let tier = entry
                    .tier
                    .unwrap_or_else(|| config.boundaries.tier_for(entry.size_gb));
                let mut tags: BTreeSet<String> = entry.tags.iter().cloned().collect();
                if tags.is_empty() {
                    tags.insert(TAG_GENERAL.to_string());
                }
                let capability = ModelCapability {
                    model_id: entry.id.clone(),
                    size_gb: entry.size_gb,
                    tier,
                    tags,
                    latency: config.latencies.envelope(tier),
                    source: CapabilitySource::Catalogue,
                };
                (entry.id.clone(), capability)
            })
            .collect();

        Self {
            boundaries: config.boundaries,
            latencies: config.latencies,
            catalogue,
            learned: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build with the built-in catalogue and default thresholds
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(&CapabilityConfig::default())
    }

    /// Tier size thresholds in use
    #[must_use]
    pub fn boundaries(&self) -> TierBoundaries {
        self.boundaries
    }

    /// Latency envelope for a tier
    #[must_use]
    pub fn envelope(&self, tier: Tier) -> LatencyEnvelope {
        self.latencies.envelope(tier)
    }

    /// Look up a known model (catalogue first, then learned)
    #[must_use]
    pub fn lookup(&self, model_id: &str) -> Option<ModelCapability> {
        if let Some(cap) = self.catalogue.get(model_id) {
            return Some(cap.clone());
        }
        self.learned.read().get(model_id).cloned()
    }

    /// Whether the model is known
    #[must_use]
    pub fn contains(&self, model_id: &str) -> bool {
        self.catalogue.contains_key(model_id) || self.learned.read().contains_key(model_id)
    }

    /// Classify a model
    ///
    /// Known models return their entry. Unknown models get a capability
    /// synthesized from `reported_size_gb` with tags `{general}`. A missing
    /// size is treated as zero, i.e. the fast tier. This never mutates the
    /// model; see [`CapabilityModel::promote`].
    #[must_use]
    pub fn classify(&self, model_id: &str, reported_size_gb: Option<f64>) -> ModelCapability {
        if let Some(cap) = self.lookup(model_id) {
            return cap;
        }
        self.synthesize(model_id, reported_size_gb.unwrap_or(0.0))
    }

    /// Classify and, if unknown, remember the model
    ///
    /// Returns the capability and whether it was newly learned.
    pub fn promote(&self, model_id: &str, reported_size_gb: f64) -> (ModelCapability, bool) {
        if let Some(cap) = self.catalogue.get(model_id) {
            return (cap.clone(), false);
        }

        let mut learned = self.learned.write();
        if let Some(cap) = learned.get(model_id) {
            return (cap.clone(), false);
        }

        let cap = self.synthesize(model_id, reported_size_gb);
        tracing::info!(
            model = model_id,
            size_gb = reported_size_gb,
            tier = %cap.tier,
            "Promoted unknown model into capability catalogue"
        );
        learned.insert(model_id.to_string(), cap.clone());
        (cap, true)
    }

    /// Known models whose tags intersect `required`
    ///
    /// Pure set-membership query over catalogue and learned entries, sorted
    /// by model id.
    #[must_use]
    pub fn tasks_supported_by(&self, required: &BTreeSet<String>) -> Vec<ModelCapability> {
        self.all()
            .into_iter()
            .filter(|cap| cap.supports(required))
            .collect()
    }

    /// Every known capability, sorted by model id
    #[must_use]
    pub fn all(&self) -> Vec<ModelCapability> {
        let learned = self.learned.read();
        let mut merged: BTreeMap<&str, &ModelCapability> = BTreeMap::new();
        for (id, cap) in learned.iter() {
            merged.insert(id.as_str(), cap);
        }
        for (id, cap) in &self.catalogue {
            merged.insert(id.as_str(), cap);
        }
        merged.into_values().cloned().collect()
    }

    /// Number of learned (runtime-promoted) models
    #[must_use]
    pub fn learned_count(&self) -> usize {
        self.learned.read().len()
    }

    fn synthesize(&self, model_id: &str, size_gb: f64) -> ModelCapability {
        let tier = self.boundaries.tier_for(size_gb);
        ModelCapability {
            model_id: model_id.to_string(),
            size_gb,
            tier,
            tags: BTreeSet::from([TAG_GENERAL.to_string()]),
            latency: self.latencies.envelope(tier),
            source: CapabilitySource::Learned,
        }
    }
}

impl Default for CapabilityModel {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for CapabilityModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityModel")
            .field("boundaries", &self.boundaries)
            .field("catalogue", &self.catalogue.len())
            .field("learned", &self.learned_count())
            .finish()
    }
}
