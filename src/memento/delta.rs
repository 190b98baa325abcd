use std::collections::BTreeSet;

use crate::memento::{EntityMemento, LocationMemento, Memento, PolicyMemento};

/// One checkpoint write: updated mementos plus removed ids, per kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MementoDelta {
    pub entities: Vec<EntityMemento>,
    pub locations: Vec<LocationMemento>,
    pub policies: Vec<PolicyMemento>,
    pub removed_entity_ids: BTreeSet<String>,
    pub removed_location_ids: BTreeSet<String>,
    pub removed_policy_ids: BTreeSet<String>,
}

impl MementoDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.locations.is_empty()
            && self.policies.is_empty()
            && self.removed_entity_ids.is_empty()
            && self.removed_location_ids.is_empty()
            && self.removed_policy_ids.is_empty()
    }

    pub fn updated_count(&self) -> usize {
        self.entities.len() + self.locations.len() + self.policies.len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed_entity_ids.len() + self.removed_location_ids.len() + self.removed_policy_ids.len()
    }

    pub fn updated_entity_ids(&self) -> Vec<&str> {
        self.entities.iter().map(|m| m.id()).collect()
    }

    pub fn updated_location_ids(&self) -> Vec<&str> {
        self.locations.iter().map(|m| m.id()).collect()
    }

    pub fn updated_policy_ids(&self) -> Vec<&str> {
        self.policies.iter().map(|m| m.id()).collect()
    }
}
