//! Unit cache: the sole authority on "is recompilation needed".

use crate::fingerprint::Fingerprint;
use crate::unit::CompiledUnit;
use dashmap::DashMap;
use std::sync::Arc;

/// In-memory cache of compiled units, keyed by unit name.
///
/// Each key maps to the last successfully compiled unit together with the
/// fingerprint of the source that produced it (carried on the unit). A
/// failed compilation attempt never touches an existing entry — retrying
/// with corrected source is the only way past a stale failure.
#[derive(Debug, Default)]
pub struct UnitCache {
    units: DashMap<String, Arc<CompiledUnit>>,
}

impl UnitCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached unit for `name`, whatever its fingerprint.
    pub fn get(&self, name: &str) -> Option<Arc<CompiledUnit>> {
        self.units.get(name).map(|entry| Arc::clone(&entry))
    }

    /// Get the cached unit for `name` only if it was compiled from source
    /// with this exact fingerprint.
    pub fn fresh(&self, name: &str, fingerprint: &Fingerprint) -> Option<Arc<CompiledUnit>> {
        self.units
            .get(name)
            .filter(|entry| entry.fingerprint == *fingerprint)
            .map(|entry| Arc::clone(&entry))
    }

    /// Insert a unit, replacing any previous version under the same name.
    pub fn insert(&self, unit: Arc<CompiledUnit>) {
        self.units.insert(unit.name.clone(), unit);
    }

    /// Remove the entry for `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<CompiledUnit>> {
        self.units.remove(name).map(|(_, unit)| unit)
    }

    /// Whether an entry exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Snapshot of all cached unit names.
    pub fn names(&self) -> Vec<String> {
        self.units.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of cached units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.units.clear();
    }
}
