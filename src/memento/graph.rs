use std::collections::{BTreeMap, BTreeSet};

use crate::core::{ObjectKind, Result};
use crate::memento::{EntityMemento, LocationMemento, Memento, MementoDelta, PolicyMemento};
use crate::model::{Entity, Location, Policy};
use std::sync::Arc;

/// The complete persisted state: every memento, keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphMemento {
    pub entities: BTreeMap<String, EntityMemento>,
    pub locations: BTreeMap<String, LocationMemento>,
    pub policies: BTreeMap<String, PolicyMemento>,
}

impl GraphMemento {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures mementos from live objects. Fails on the first object that
    /// cannot produce one.
    pub fn from_objects(
        entities: &[Arc<dyn Entity>],
        locations: &[Arc<dyn Location>],
        policies: &[Arc<dyn Policy>],
    ) -> Result<Self> {
        let mut graph = Self::new();
        for entity in entities {
            graph.insert_entity(entity.memento()?);
        }
        for location in locations {
            graph.insert_location(location.memento()?);
        }
        for policy in policies {
            graph.insert_policy(policy.memento()?);
        }
        Ok(graph)
    }

    pub fn insert_entity(&mut self, memento: EntityMemento) {
        self.entities.insert(memento.id().to_string(), memento);
    }

    pub fn insert_location(&mut self, memento: LocationMemento) {
        self.locations.insert(memento.id().to_string(), memento);
    }

    pub fn insert_policy(&mut self, memento: PolicyMemento) {
        self.policies.insert(memento.id().to_string(), memento);
    }

    /// Upserts the delta's mementos, then drops its removed ids.
    pub fn apply_delta(&mut self, delta: MementoDelta) {
        for memento in delta.entities {
            self.insert_entity(memento);
        }
        for memento in delta.locations {
            self.insert_location(memento);
        }
        for memento in delta.policies {
            self.insert_policy(memento);
        }
        for id in &delta.removed_entity_ids {
            self.entities.remove(id);
        }
        for id in &delta.removed_location_ids {
            self.locations.remove(id);
        }
        for id in &delta.removed_policy_ids {
            self.policies.remove(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.locations.is_empty() && self.policies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.locations.len() + self.policies.len()
    }

    pub fn contains(&self, kind: ObjectKind, id: &str) -> bool {
        match kind {
            ObjectKind::Entity => self.entities.contains_key(id),
            ObjectKind::Location => self.locations.contains_key(id),
            ObjectKind::Policy => self.policies.contains_key(id),
        }
    }

    pub fn application_ids(&self) -> Vec<&str> {
        self.entities
            .values()
            .filter(|m| m.is_application())
            .map(|m| m.id())
            .collect()
    }

    /// Every (kind, id) referenced by some memento but absent from the graph.
    pub fn dangling_references(&self) -> BTreeSet<(ObjectKind, String)> {
        let mut missing = BTreeSet::new();
        let mut check = |kind: ObjectKind, id: &str| {
            if !self.contains(kind, id) {
                missing.insert((kind, id.to_string()));
            }
        };

        for memento in self.entities.values() {
            if let Some(parent) = memento.parent_id() {
                check(ObjectKind::Entity, parent);
            }
            if let Some(app) = memento.application_id() {
                check(ObjectKind::Entity, app);
            }
            for id in memento.children_ids() {
                check(ObjectKind::Entity, id);
            }
            for id in memento.location_ids() {
                check(ObjectKind::Location, id);
            }
            for id in memento.policy_ids().iter().chain(memento.enricher_ids()) {
                check(ObjectKind::Policy, id);
            }
        }
        for memento in self.locations.values() {
            if let Some(parent) = memento.parent_id() {
                check(ObjectKind::Location, parent);
            }
            for id in memento.children_ids() {
                check(ObjectKind::Location, id);
            }
        }

        let value_refs = self
            .entities
            .values()
            .map(|m| m.value_references())
            .chain(self.locations.values().map(|m| m.value_references()))
            .chain(self.policies.values().map(|m| m.value_references()))
            .collect::<Vec<_>>();
        for (entities, locations) in value_refs {
            for id in entities {
                check(ObjectKind::Entity, &id);
            }
            for id in locations {
                check(ObjectKind::Location, &id);
            }
        }

        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_delta_upserts_then_removes() {
        let mut graph = GraphMemento::new();
        graph.insert_entity(EntityMemento::builder("e1", "App").build());
        graph.insert_entity(EntityMemento::builder("e2", "Web").build());

        let mut delta = MementoDelta::new();
        delta
            .entities
            .push(EntityMemento::builder("e1", "App").display_name("renamed").build());
        delta.removed_entity_ids.insert("e2".to_string());
        graph.apply_delta(delta);

        assert_eq!(graph.entities.len(), 1);
        assert_eq!(graph.entities["e1"].display_name(), Some("renamed"));
    }

    #[test]
    fn reports_dangling_relational_references() {
        let mut graph = GraphMemento::new();
        graph.insert_entity(
            EntityMemento::builder("e1", "App")
                .location_id("missing-loc")
                .child_id("e2")
                .build(),
        );
        graph.insert_entity(
            EntityMemento::builder("e2", "Web")
                .parent_id(Some("e1".to_string()))
                .build(),
        );

        let dangling = graph.dangling_references();
        assert_eq!(dangling.len(), 1);
        assert!(dangling.contains(&(ObjectKind::Location, "missing-loc".to_string())));
    }
}
