//! Immutable snapshot records for entities, locations and policies.
//!
//! Every reference between managed objects is held as an id. That keeps
//! parent/child and group/member cycles representable without recursion.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::{MementoValue, ObjectKind};

mod delta;
mod graph;

pub use delta::MementoDelta;
pub use graph::GraphMemento;

/// State shared by every memento kind.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicMemento {
    id: String,
    type_name: String,
    display_name: Option<String>,
    config: BTreeMap<String, MementoValue>,
    attributes: BTreeMap<String, MementoValue>,
    tags: BTreeSet<String>,
}

impl BasicMemento {
    fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            display_name: None,
            config: BTreeMap::new(),
            attributes: BTreeMap::new(),
            tags: BTreeSet::new(),
        }
    }
}

/// Read access common to all memento kinds.
pub trait Memento {
    fn kind(&self) -> ObjectKind;

    fn base(&self) -> &BasicMemento;

    fn id(&self) -> &str {
        &self.base().id
    }

    fn type_name(&self) -> &str {
        &self.base().type_name
    }

    fn display_name(&self) -> Option<&str> {
        self.base().display_name.as_deref()
    }

    fn config(&self) -> &BTreeMap<String, MementoValue> {
        &self.base().config
    }

    fn attributes(&self) -> &BTreeMap<String, MementoValue> {
        &self.base().attributes
    }

    fn tags(&self) -> &BTreeSet<String> {
        &self.base().tags
    }

    /// Ids referenced from config and attribute values (entities, locations).
    fn value_references(&self) -> (Vec<String>, Vec<String>) {
        let mut entities = Vec::new();
        let mut locations = Vec::new();
        for value in self.config().values().chain(self.attributes().values()) {
            value.referenced_ids(&mut entities, &mut locations);
        }
        (entities, locations)
    }
}

macro_rules! basic_builder_methods {
    () => {
        pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
            self.base.display_name = Some(display_name.into());
            self
        }

        pub fn maybe_display_name(mut self, display_name: Option<String>) -> Self {
            self.base.display_name = display_name;
            self
        }

        pub fn config(mut self, key: impl Into<String>, value: impl Into<MementoValue>) -> Self {
            self.base.config.insert(key.into(), value.into());
            self
        }

        pub fn configs(mut self, entries: BTreeMap<String, MementoValue>) -> Self {
            self.base.config.extend(entries);
            self
        }

        pub fn attribute(mut self, key: impl Into<String>, value: impl Into<MementoValue>) -> Self {
            self.base.attributes.insert(key.into(), value.into());
            self
        }

        pub fn attributes(mut self, entries: BTreeMap<String, MementoValue>) -> Self {
            self.base.attributes.extend(entries);
            self
        }

        pub fn tag(mut self, tag: impl Into<String>) -> Self {
            self.base.tags.insert(tag.into());
            self
        }

        pub fn tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
            self.base.tags.extend(tags);
            self
        }
    };
}

// ============================================================================
// Entity
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EntityMemento {
    base: BasicMemento,
    parent_id: Option<String>,
    children_ids: Vec<String>,
    location_ids: Vec<String>,
    policy_ids: Vec<String>,
    enricher_ids: Vec<String>,
    application_id: Option<String>,
}

impl EntityMemento {
    pub fn builder(id: impl Into<String>, type_name: impl Into<String>) -> EntityMementoBuilder {
        EntityMementoBuilder {
            base: BasicMemento::new(id, type_name),
            parent_id: None,
            children_ids: Vec::new(),
            location_ids: Vec::new(),
            policy_ids: Vec::new(),
            enricher_ids: Vec::new(),
            application_id: None,
        }
    }

    /// A builder seeded with this memento's contents.
    pub fn to_builder(&self) -> EntityMementoBuilder {
        EntityMementoBuilder {
            base: self.base.clone(),
            parent_id: self.parent_id.clone(),
            children_ids: self.children_ids.clone(),
            location_ids: self.location_ids.clone(),
            policy_ids: self.policy_ids.clone(),
            enricher_ids: self.enricher_ids.clone(),
            application_id: self.application_id.clone(),
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn children_ids(&self) -> &[String] {
        &self.children_ids
    }

    pub fn location_ids(&self) -> &[String] {
        &self.location_ids
    }

    pub fn policy_ids(&self) -> &[String] {
        &self.policy_ids
    }

    pub fn enricher_ids(&self) -> &[String] {
        &self.enricher_ids
    }

    pub fn application_id(&self) -> Option<&str> {
        self.application_id.as_deref()
    }

    /// Roots of the graph: no parent, and owned by no other application.
    pub fn is_application(&self) -> bool {
        self.parent_id.is_none()
            && self
                .application_id
                .as_deref()
                .is_none_or(|app| app == self.base.id)
    }
}

impl Memento for EntityMemento {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Entity
    }

    fn base(&self) -> &BasicMemento {
        &self.base
    }
}

#[derive(Debug, Clone)]
pub struct EntityMementoBuilder {
    base: BasicMemento,
    parent_id: Option<String>,
    children_ids: Vec<String>,
    location_ids: Vec<String>,
    policy_ids: Vec<String>,
    enricher_ids: Vec<String>,
    application_id: Option<String>,
}

impl EntityMementoBuilder {
    basic_builder_methods!();

    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.base.type_name = type_name.into();
        self
    }

    pub fn parent_id(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn child_id(mut self, child_id: impl Into<String>) -> Self {
        self.children_ids.push(child_id.into());
        self
    }

    pub fn children_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.children_ids.extend(ids);
        self
    }

    pub fn location_id(mut self, location_id: impl Into<String>) -> Self {
        self.location_ids.push(location_id.into());
        self
    }

    pub fn location_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.location_ids.extend(ids);
        self
    }

    pub fn policy_id(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_ids.push(policy_id.into());
        self
    }

    pub fn policy_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.policy_ids.extend(ids);
        self
    }

    pub fn enricher_id(mut self, enricher_id: impl Into<String>) -> Self {
        self.enricher_ids.push(enricher_id.into());
        self
    }

    pub fn enricher_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.enricher_ids.extend(ids);
        self
    }

    pub fn application_id(mut self, application_id: Option<String>) -> Self {
        self.application_id = application_id;
        self
    }

    pub fn build(self) -> EntityMemento {
        EntityMemento {
            base: self.base,
            parent_id: self.parent_id,
            children_ids: self.children_ids,
            location_ids: self.location_ids,
            policy_ids: self.policy_ids,
            enricher_ids: self.enricher_ids,
            application_id: self.application_id,
        }
    }
}

// ============================================================================
// Location
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LocationMemento {
    base: BasicMemento,
    parent_id: Option<String>,
    children_ids: Vec<String>,
}

impl LocationMemento {
    pub fn builder(id: impl Into<String>, type_name: impl Into<String>) -> LocationMementoBuilder {
        LocationMementoBuilder {
            base: BasicMemento::new(id, type_name),
            parent_id: None,
            children_ids: Vec::new(),
        }
    }

    pub fn to_builder(&self) -> LocationMementoBuilder {
        LocationMementoBuilder {
            base: self.base.clone(),
            parent_id: self.parent_id.clone(),
            children_ids: self.children_ids.clone(),
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn children_ids(&self) -> &[String] {
        &self.children_ids
    }
}

impl Memento for LocationMemento {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Location
    }

    fn base(&self) -> &BasicMemento {
        &self.base
    }
}

#[derive(Debug, Clone)]
pub struct LocationMementoBuilder {
    base: BasicMemento,
    parent_id: Option<String>,
    children_ids: Vec<String>,
}

impl LocationMementoBuilder {
    basic_builder_methods!();

    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.base.type_name = type_name.into();
        self
    }

    pub fn parent_id(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn child_id(mut self, child_id: impl Into<String>) -> Self {
        self.children_ids.push(child_id.into());
        self
    }

    pub fn children_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.children_ids.extend(ids);
        self
    }

    pub fn build(self) -> LocationMemento {
        LocationMemento {
            base: self.base,
            parent_id: self.parent_id,
            children_ids: self.children_ids,
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Policies own no children. `flags` holds construction-time settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyMemento {
    base: BasicMemento,
    flags: BTreeMap<String, MementoValue>,
}

impl PolicyMemento {
    pub fn builder(id: impl Into<String>, type_name: impl Into<String>) -> PolicyMementoBuilder {
        PolicyMementoBuilder {
            base: BasicMemento::new(id, type_name),
            flags: BTreeMap::new(),
        }
    }

    pub fn to_builder(&self) -> PolicyMementoBuilder {
        PolicyMementoBuilder {
            base: self.base.clone(),
            flags: self.flags.clone(),
        }
    }

    pub fn flags(&self) -> &BTreeMap<String, MementoValue> {
        &self.flags
    }
}

impl Memento for PolicyMemento {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Policy
    }

    fn base(&self) -> &BasicMemento {
        &self.base
    }

    fn value_references(&self) -> (Vec<String>, Vec<String>) {
        let mut entities = Vec::new();
        let mut locations = Vec::new();
        for value in self
            .config()
            .values()
            .chain(self.attributes().values())
            .chain(self.flags.values())
        {
            value.referenced_ids(&mut entities, &mut locations);
        }
        (entities, locations)
    }
}

#[derive(Debug, Clone)]
pub struct PolicyMementoBuilder {
    base: BasicMemento,
    flags: BTreeMap<String, MementoValue>,
}

impl PolicyMementoBuilder {
    basic_builder_methods!();

    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.base.type_name = type_name.into();
        self
    }

    pub fn flag(mut self, key: impl Into<String>, value: impl Into<MementoValue>) -> Self {
        self.flags.insert(key.into(), value.into());
        self
    }

    pub fn flags(mut self, entries: BTreeMap<String, MementoValue>) -> Self {
        self.flags.extend(entries);
        self
    }

    pub fn build(self) -> PolicyMemento {
        PolicyMemento {
            base: self.base,
            flags: self.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_builder_keeps_relationship_order() {
        let memento = EntityMemento::builder("e1", "WebCluster")
            .display_name("web")
            .config("size", 3i64)
            .attribute("service.up", true)
            .tag("prod")
            .parent_id(Some("app".to_string()))
            .child_id("c2")
            .child_id("c1")
            .location_id("l1")
            .policy_id("p1")
            .application_id(Some("app".to_string()))
            .build();

        assert_eq!(memento.id(), "e1");
        assert_eq!(memento.kind(), ObjectKind::Entity);
        assert_eq!(memento.display_name(), Some("web"));
        assert_eq!(memento.children_ids(), ["c2".to_string(), "c1".to_string()]);
        assert_eq!(memento.config().get("size"), Some(&MementoValue::Integer(3)));
        assert!(memento.tags().contains("prod"));
        assert!(!memento.is_application());
    }

    #[test]
    fn roots_are_applications() {
        let app = EntityMemento::builder("app", "App").build();
        assert!(app.is_application());

        let owned_by_self = EntityMemento::builder("app", "App")
            .application_id(Some("app".to_string()))
            .build();
        assert!(owned_by_self.is_application());
    }

    #[test]
    fn to_builder_copies_everything() {
        let original = PolicyMemento::builder("p1", "AutoScaler")
            .flag("min", 1i64)
            .config("max", 5i64)
            .build();
        let copy = original.to_builder().build();
        assert_eq!(original, copy);

        let renamed = original.to_builder().type_name("Scaler").build();
        assert_eq!(renamed.type_name(), "Scaler");
        assert_eq!(renamed.flags(), original.flags());
    }
}
