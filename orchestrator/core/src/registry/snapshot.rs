//! Immutable registry snapshots

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::instance::{Instance, InstanceContent, InstanceId};

/// Point-in-time copy of the registry used for one routing decision
///
/// Instances are sorted by identity so iteration order is deterministic.
#[derive(Clone, Debug, Serialize)]
pub struct RegistrySnapshot {
    version: u64,
    taken_at: DateTime<Utc>,
    instances: Vec<Instance>,
}

impl RegistrySnapshot {
    /// Build a snapshot from unordered instance records
    #[must_use]
    pub fn new(version: u64, mut instances: Vec<Instance>) -> Self {
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            version,
            taken_at: Utc::now(),
            instances,
        }
    }

    /// Registry version this snapshot was taken at
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When the snapshot was taken
    #[must_use]
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// All instances, sorted by identity
    #[must_use]
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Iterate instances in identity order
    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter()
    }

    /// Look up one instance
    #[must_use]
    pub fn get(&self, id: &InstanceId) -> Option<&Instance> {
        self.instances
            .binary_search_by(|i| i.id.cmp(id))
            .ok()
            .map(|idx| &self.instances[idx])
    }

    /// Number of instances
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the snapshot has no instances
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances currently `healthy`
    pub fn healthy(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|i| i.is_healthy())
    }

    /// Model id to the healthy instances advertising it
    #[must_use]
    pub fn models_index(&self) -> BTreeMap<String, Vec<InstanceId>> {
        let mut index: BTreeMap<String, Vec<InstanceId>> = BTreeMap::new();
        for instance in self.healthy() {
            for model in &instance.models {
                index
                    .entry(model.clone())
                    .or_default()
                    .push(instance.id.clone());
            }
        }
        index
    }

    /// Timestamp-free content of every instance, as a set
    #[must_use]
    pub fn content(&self) -> BTreeSet<InstanceContent> {
        self.instances.iter().map(Instance::content).collect()
    }

    /// Order-independent content equality, ignoring versions and timestamps
    #[must_use]
    pub fn same_content(&self, other: &RegistrySnapshot) -> bool {
        self.content() == other.content()
    }
}
