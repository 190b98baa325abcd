use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::{Entity, Location, Policy};

/// One checkpoint window: objects changed since the last swap and ids
/// removed since the last swap, per kind.
///
/// An id never sits in both the changed and removed set of one kind.
#[derive(Default)]
pub struct DeltaSnapshot {
    pub entities: BTreeMap<String, Arc<dyn Entity>>,
    pub locations: BTreeMap<String, Arc<dyn Location>>,
    pub policies: BTreeMap<String, Arc<dyn Policy>>,
    pub removed_entity_ids: BTreeSet<String>,
    pub removed_location_ids: BTreeSet<String>,
    pub removed_policy_ids: BTreeSet<String>,
}

impl DeltaSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.locations.is_empty()
            && self.policies.is_empty()
            && self.removed_entity_ids.is_empty()
            && self.removed_location_ids.is_empty()
            && self.removed_policy_ids.is_empty()
    }

    pub fn changed_count(&self) -> usize {
        self.entities.len() + self.locations.len() + self.policies.len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed_entity_ids.len() + self.removed_location_ids.len() + self.removed_policy_ids.len()
    }

    // Removal wins for the rest of the window: an object unmanaged and then
    // touched again must not be written back.

    pub(crate) fn add_entity(&mut self, entity: Arc<dyn Entity>) {
        if !self.removed_entity_ids.contains(entity.id()) {
            self.entities.entry(entity.id().to_string()).or_insert(entity);
        }
    }

    pub(crate) fn add_location(&mut self, location: Arc<dyn Location>) {
        if !self.removed_location_ids.contains(location.id()) {
            self.locations
                .entry(location.id().to_string())
                .or_insert(location);
        }
    }

    pub(crate) fn add_policy(&mut self, policy: Arc<dyn Policy>) {
        if !self.removed_policy_ids.contains(policy.id()) {
            self.policies.entry(policy.id().to_string()).or_insert(policy);
        }
    }

    pub(crate) fn remove_entity(&mut self, id: &str) {
        self.entities.remove(id);
        self.removed_entity_ids.insert(id.to_string());
    }

    pub(crate) fn remove_location(&mut self, id: &str) {
        self.locations.remove(id);
        self.removed_location_ids.insert(id.to_string());
    }

    pub(crate) fn remove_policy(&mut self, id: &str) {
        self.policies.remove(id);
        self.removed_policy_ids.insert(id.to_string());
    }
}

impl fmt::Debug for DeltaSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaSnapshot")
            .field("entities", &self.entities.keys().collect::<Vec<_>>())
            .field("locations", &self.locations.keys().collect::<Vec<_>>())
            .field("policies", &self.policies.keys().collect::<Vec<_>>())
            .field("removed_entity_ids", &self.removed_entity_ids)
            .field("removed_location_ids", &self.removed_location_ids)
            .field("removed_policy_ids", &self.removed_policy_ids)
            .finish()
    }
}

/// Thread-safe accumulator for the current window.
///
/// Every operation holds the lock for O(1) or O(log n) work only. `swap`
/// moves the window out and leaves an empty one behind; nothing is copied.
/// Record operations never fail: a poisoned lock is recovered because the
/// window stays structurally valid whatever panicked.
#[derive(Debug, Default)]
pub struct DeltaCollector {
    window: Mutex<DeltaSnapshot>,
}

impl DeltaCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DeltaSnapshot> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_changed_entity(&self, entity: Arc<dyn Entity>) {
        self.lock().add_entity(entity);
    }

    pub fn record_changed_location(&self, location: Arc<dyn Location>) {
        self.lock().add_location(location);
    }

    pub fn record_changed_policy(&self, policy: Arc<dyn Policy>) {
        self.lock().add_policy(policy);
    }

    pub fn record_removed_entity(&self, id: &str) {
        self.lock().remove_entity(id);
    }

    pub fn record_removed_location(&self, id: &str) {
        self.lock().remove_location(id);
    }

    pub fn record_removed_policy(&self, id: &str) {
        self.lock().remove_policy(id);
    }

    /// Takes the current window and installs a fresh one.
    pub fn swap(&self) -> DeltaSnapshot {
        mem::take(&mut *self.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops everything recorded in the current window.
    pub fn clear(&self) {
        drop(self.swap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BasicEntity, BasicLocation};

    #[test]
    fn repeated_changes_collapse() {
        let collector = DeltaCollector::new();
        let e1 = BasicEntity::with_id("e1", "App");
        collector.record_changed_entity(e1.clone());
        collector.record_changed_entity(e1);

        let window = collector.swap();
        assert_eq!(window.entities.len(), 1);
        assert!(collector.is_empty());
    }

    #[test]
    fn removal_wins_in_either_order() {
        let collector = DeltaCollector::new();
        let e1 = BasicEntity::with_id("e1", "App");
        let e2 = BasicEntity::with_id("e2", "App");

        collector.record_changed_entity(e1.clone());
        collector.record_removed_entity("e1");
        collector.record_removed_entity("e2");
        collector.record_changed_entity(e2);

        let window = collector.swap();
        assert!(window.entities.is_empty());
        assert_eq!(
            window.removed_entity_ids.iter().collect::<Vec<_>>(),
            vec!["e1", "e2"]
        );
    }

    #[test]
    fn kinds_are_tracked_separately() {
        let collector = DeltaCollector::new();
        collector.record_changed_location(BasicLocation::with_id("x", "Host"));
        collector.record_removed_entity("x");

        let window = collector.swap();
        assert_eq!(window.locations.len(), 1);
        assert_eq!(window.removed_count(), 1);
        assert!(!window.is_empty());
    }

    #[test]
    fn clear_discards_the_window() {
        let collector = DeltaCollector::new();
        collector.record_removed_policy("p1");
        collector.clear();
        assert!(collector.swap().is_empty());
    }
}
