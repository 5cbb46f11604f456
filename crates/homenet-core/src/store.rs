//! Per-entity state with publish deduplication.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::{StateDelta, Value};

/// Effects returned by a merge, in emission order.
///
/// The store is Sans-IO: the bus runtime turns `Publish` into a retained
/// broker publish and `Changed` into automation state triggers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEffect {
    /// Retained state publish: the serialized record changed.
    Publish {
        /// Entity id.
        entity_id: String,
        /// JSON-serialized state record.
        payload: String,
    },
    /// State-changed event; emitted on every merge, in merge order.
    Changed {
        /// Entity id.
        entity_id: String,
        /// Snapshot of the merged record.
        state: StateDelta,
    },
}

#[derive(Debug, Default)]
struct EntityRecord {
    state: StateDelta,
    version: u64,
    published: Option<String>,
}

/// Read-only view of bus state shared with automation invocations.
///
/// The store is the sole writer; readers observe complete snapshots (a merge
/// never publishes a half-updated record through this view).
#[derive(Debug, Clone, Default)]
pub struct StateView {
    inner: Arc<RwLock<HashMap<String, StateDelta>>>,
}

impl StateView {
    /// Snapshot of one entity's record.
    pub fn entity(&self, entity_id: &str) -> Option<StateDelta> {
        self.inner.read().ok()?.get(entity_id).cloned()
    }

    /// One property of one entity.
    pub fn property(&self, entity_id: &str, property: &str) -> Option<Value> {
        self.inner.read().ok()?.get(entity_id)?.get(property).cloned()
    }

    /// Snapshot of every entity record.
    pub fn all(&self) -> HashMap<String, StateDelta> {
        self.inner.read().map(|map| map.clone()).unwrap_or_default()
    }

    fn write(&self, entity_id: &str, state: &StateDelta) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(entity_id.to_owned(), state.clone());
        }
    }
}

/// Current state per entity, with a monotonic version counter and a
/// last-publish fingerprint for retain-deduplication.
#[derive(Debug, Default)]
pub struct StateStore {
    records: HashMap<String, EntityRecord>,
    view: StateView,
}

impl StateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared read view handed to automation.
    pub fn view(&self) -> StateView {
        self.view.clone()
    }

    /// Merge a delta into an entity's record.
    ///
    /// Shallow per-key merge; bumps the version when content changed. Returns
    /// a `Publish` effect only when the serialized record differs from the
    /// last published fingerprint (two identical merges publish once), and a
    /// `Changed` event on every merge.
    pub fn merge(&mut self, entity_id: &str, delta: StateDelta) -> Vec<StoreEffect> {
        let record = self.records.entry(entity_id.to_owned()).or_default();
        let mut changed = false;
        for (key, value) in delta {
            if record.state.get(&key) != Some(&value) {
                record.state.insert(key, value);
                changed = true;
            }
        }
        if changed {
            record.version += 1;
            self.view.write(entity_id, &record.state);
        }

        let mut effects = Vec::with_capacity(2);
        // serde_json cannot fail on a map of plain scalars.
        if let Ok(payload) = serde_json::to_string(&record.state)
            && record.published.as_deref() != Some(payload.as_str())
        {
            record.published = Some(payload.clone());
            effects.push(StoreEffect::Publish { entity_id: entity_id.to_owned(), payload });
        }
        effects.push(StoreEffect::Changed {
            entity_id: entity_id.to_owned(),
            state: record.state.clone(),
        });
        effects
    }

    /// Current record of one entity.
    pub fn get(&self, entity_id: &str) -> Option<&StateDelta> {
        self.records.get(entity_id).map(|record| &record.state)
    }

    /// Version counter of one entity's record.
    pub fn version(&self, entity_id: &str) -> u64 {
        self.records.get(entity_id).map_or(0, |record| record.version)
    }
}
