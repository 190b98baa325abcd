//! On-disk shapes for mementos and the documents that carry them.
//!
//! These types never hold live handles. References are plain ids, and type
//! names are already aliased.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::{MementoError, MementoValue, Result};
use crate::memento::{EntityMemento, LocationMemento, Memento, MementoDelta, PolicyMemento};
use crate::serializer::{LookupContext, TypeAliases};

pub(crate) const DOCUMENT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub(crate) enum WireValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    EntityRef(WireRef),
    LocationRef(WireRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireBase {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, WireValue>,
    #[serde(default)]
    pub attributes: BTreeMap<String, WireValue>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireEntity {
    pub base: WireBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children_ids: Vec<String>,
    #[serde(default)]
    pub location_ids: Vec<String>,
    #[serde(default)]
    pub policy_ids: Vec<String>,
    #[serde(default)]
    pub enricher_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireLocation {
    pub base: WireBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WirePolicy {
    pub base: WireBase,
    #[serde(default)]
    pub flags: BTreeMap<String, WireValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DocumentKind {
    Delta,
    Checkpoint,
}

/// A delta or a full checkpoint, as written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireDocument {
    pub format_version: u16,
    pub kind: DocumentKind,
    pub created_at_unix_ms: i64,
    #[serde(default)]
    pub entities: Vec<WireEntity>,
    #[serde(default)]
    pub locations: Vec<WireLocation>,
    #[serde(default)]
    pub policies: Vec<WirePolicy>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub removed_entity_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub removed_location_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub removed_policy_ids: BTreeSet<String>,
}

impl WireDocument {
    pub fn new(kind: DocumentKind) -> Self {
        Self {
            format_version: DOCUMENT_FORMAT_VERSION,
            kind,
            created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
            entities: Vec::new(),
            locations: Vec::new(),
            policies: Vec::new(),
            removed_entity_ids: BTreeSet::new(),
            removed_location_ids: BTreeSet::new(),
            removed_policy_ids: BTreeSet::new(),
        }
    }

    pub fn check_version(&self) -> Result<()> {
        if self.format_version > DOCUMENT_FORMAT_VERSION {
            return Err(MementoError::Encoding(format!(
                "unsupported document format version {} (newest known is {})",
                self.format_version, DOCUMENT_FORMAT_VERSION
            )));
        }
        Ok(())
    }
}

/// Documents folded in write order, keyed by id. The stored state a file or
/// memory backend would load.
#[derive(Debug, Clone, Default)]
pub(crate) struct WireGraph {
    pub entities: BTreeMap<String, WireEntity>,
    pub locations: BTreeMap<String, WireLocation>,
    pub policies: BTreeMap<String, WirePolicy>,
}

impl WireGraph {
    /// A checkpoint replaces everything; a delta upserts and then removes.
    pub fn apply(&mut self, document: WireDocument) {
        if document.kind == DocumentKind::Checkpoint {
            self.entities.clear();
            self.locations.clear();
            self.policies.clear();
        }
        for entity in document.entities {
            self.entities.insert(entity.base.id.clone(), entity);
        }
        for location in document.locations {
            self.locations.insert(location.base.id.clone(), location);
        }
        for policy in document.policies {
            self.policies.insert(policy.base.id.clone(), policy);
        }
        for id in &document.removed_entity_ids {
            self.entities.remove(id);
        }
        for id in &document.removed_location_ids {
            self.locations.remove(id);
        }
        for id in &document.removed_policy_ids {
            self.policies.remove(id);
        }
    }

    pub fn into_checkpoint(self) -> WireDocument {
        let mut document = WireDocument::new(DocumentKind::Checkpoint);
        document.entities = self.entities.into_values().collect();
        document.locations = self.locations.into_values().collect();
        document.policies = self.policies.into_values().collect();
        document
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.locations.len() + self.policies.len()
    }
}

// ============================================================================
// Model -> wire
// ============================================================================

/// `None` for a deferred value that has not settled successfully.
fn value_to_wire(value: &MementoValue, aliases: &TypeAliases) -> Option<WireValue> {
    let wire = match value {
        MementoValue::Null => WireValue::Null,
        MementoValue::Boolean(b) => WireValue::Boolean(*b),
        MementoValue::Integer(i) => WireValue::Integer(*i),
        MementoValue::Float(f) => WireValue::Float(*f),
        MementoValue::Text(s) => WireValue::Text(s.clone()),
        MementoValue::List(items) => WireValue::List(
            items
                .iter()
                .map(|item| value_to_wire(item, aliases).unwrap_or(WireValue::Null))
                .collect(),
        ),
        MementoValue::Map(entries) => WireValue::Map(map_to_wire(entries, aliases)),
        MementoValue::Entity(entity) => WireValue::EntityRef(WireRef {
            id: entity.id().to_string(),
            expected_type: entity.declared_type().map(|t| aliases.encode_name(t).to_string()),
        }),
        MementoValue::Location(location) => WireValue::LocationRef(WireRef {
            id: location.id().to_string(),
            expected_type: location
                .declared_type()
                .map(|t| aliases.encode_name(t).to_string()),
        }),
        MementoValue::Deferred(deferred) => return value_to_wire(deferred.value()?, aliases),
    };
    Some(wire)
}

fn map_to_wire(
    entries: &BTreeMap<String, MementoValue>,
    aliases: &TypeAliases,
) -> BTreeMap<String, WireValue> {
    entries
        .iter()
        .filter_map(|(key, value)| value_to_wire(value, aliases).map(|wire| (key.clone(), wire)))
        .collect()
}

fn base_to_wire(memento: &impl Memento, aliases: &TypeAliases) -> WireBase {
    WireBase {
        id: memento.id().to_string(),
        type_name: aliases.encode_name(memento.type_name()).to_string(),
        display_name: memento.display_name().map(str::to_string),
        config: map_to_wire(memento.config(), aliases),
        attributes: map_to_wire(memento.attributes(), aliases),
        tags: memento.tags().clone(),
    }
}

pub(crate) fn entity_to_wire(memento: &EntityMemento, aliases: &TypeAliases) -> WireEntity {
    WireEntity {
        base: base_to_wire(memento, aliases),
        parent_id: memento.parent_id().map(str::to_string),
        children_ids: memento.children_ids().to_vec(),
        location_ids: memento.location_ids().to_vec(),
        policy_ids: memento.policy_ids().to_vec(),
        enricher_ids: memento.enricher_ids().to_vec(),
        application_id: memento.application_id().map(str::to_string),
    }
}

pub(crate) fn location_to_wire(memento: &LocationMemento, aliases: &TypeAliases) -> WireLocation {
    WireLocation {
        base: base_to_wire(memento, aliases),
        parent_id: memento.parent_id().map(str::to_string),
        children_ids: memento.children_ids().to_vec(),
    }
}

pub(crate) fn policy_to_wire(memento: &PolicyMemento, aliases: &TypeAliases) -> WirePolicy {
    WirePolicy {
        base: base_to_wire(memento, aliases),
        flags: map_to_wire(memento.flags(), aliases),
    }
}

pub(crate) fn delta_to_wire(delta: &MementoDelta, aliases: &TypeAliases) -> WireDocument {
    let mut document = WireDocument::new(DocumentKind::Delta);
    document.entities = delta.entities.iter().map(|m| entity_to_wire(m, aliases)).collect();
    document.locations = delta
        .locations
        .iter()
        .map(|m| location_to_wire(m, aliases))
        .collect();
    document.policies = delta.policies.iter().map(|m| policy_to_wire(m, aliases)).collect();
    document.removed_entity_ids = delta.removed_entity_ids.clone();
    document.removed_location_ids = delta.removed_location_ids.clone();
    document.removed_policy_ids = delta.removed_policy_ids.clone();
    document
}

// ============================================================================
// Wire -> model
// ============================================================================

fn value_from_wire(
    wire: WireValue,
    aliases: &TypeAliases,
    lookup: &dyn LookupContext,
) -> Result<MementoValue> {
    Ok(match wire {
        WireValue::Null => MementoValue::Null,
        WireValue::Boolean(b) => MementoValue::Boolean(b),
        WireValue::Integer(i) => MementoValue::Integer(i),
        WireValue::Float(f) => MementoValue::Float(f),
        WireValue::Text(s) => MementoValue::Text(s),
        WireValue::List(items) => MementoValue::List(
            items
                .into_iter()
                .map(|item| value_from_wire(item, aliases, lookup))
                .collect::<Result<_>>()?,
        ),
        WireValue::Map(entries) => MementoValue::Map(map_from_wire(entries, aliases, lookup)?),
        WireValue::EntityRef(reference) => {
            let expected = reference.expected_type.map(|t| aliases.decode_name(&t));
            MementoValue::Entity(lookup.lookup_entity(expected.as_deref(), &reference.id)?)
        }
        WireValue::LocationRef(reference) => {
            let expected = reference.expected_type.map(|t| aliases.decode_name(&t));
            MementoValue::Location(lookup.lookup_location(expected.as_deref(), &reference.id)?)
        }
    })
}

fn map_from_wire(
    entries: BTreeMap<String, WireValue>,
    aliases: &TypeAliases,
    lookup: &dyn LookupContext,
) -> Result<BTreeMap<String, MementoValue>> {
    entries
        .into_iter()
        .map(|(key, value)| Ok((key, value_from_wire(value, aliases, lookup)?)))
        .collect()
}

struct DecodedBase {
    id: String,
    type_name: String,
    display_name: Option<String>,
    config: BTreeMap<String, MementoValue>,
    attributes: BTreeMap<String, MementoValue>,
    tags: BTreeSet<String>,
}

fn base_from_wire(
    base: WireBase,
    aliases: &TypeAliases,
    lookup: &dyn LookupContext,
) -> Result<DecodedBase> {
    Ok(DecodedBase {
        type_name: aliases.decode_name(&base.type_name),
        config: map_from_wire(base.config, aliases, lookup)?,
        attributes: map_from_wire(base.attributes, aliases, lookup)?,
        id: base.id,
        display_name: base.display_name,
        tags: base.tags,
    })
}

pub(crate) fn entity_from_wire(
    wire: WireEntity,
    aliases: &TypeAliases,
    lookup: &dyn LookupContext,
) -> Result<EntityMemento> {
    let base = base_from_wire(wire.base, aliases, lookup)?;
    Ok(EntityMemento::builder(base.id, base.type_name)
        .maybe_display_name(base.display_name)
        .configs(base.config)
        .attributes(base.attributes)
        .tags(base.tags)
        .parent_id(wire.parent_id)
        .children_ids(wire.children_ids)
        .location_ids(wire.location_ids)
        .policy_ids(wire.policy_ids)
        .enricher_ids(wire.enricher_ids)
        .application_id(wire.application_id)
        .build())
}

pub(crate) fn location_from_wire(
    wire: WireLocation,
    aliases: &TypeAliases,
    lookup: &dyn LookupContext,
) -> Result<LocationMemento> {
    let base = base_from_wire(wire.base, aliases, lookup)?;
    Ok(LocationMemento::builder(base.id, base.type_name)
        .maybe_display_name(base.display_name)
        .configs(base.config)
        .attributes(base.attributes)
        .tags(base.tags)
        .parent_id(wire.parent_id)
        .children_ids(wire.children_ids)
        .build())
}

pub(crate) fn policy_from_wire(
    wire: WirePolicy,
    aliases: &TypeAliases,
    lookup: &dyn LookupContext,
) -> Result<PolicyMemento> {
    let base = base_from_wire(wire.base, aliases, lookup)?;
    Ok(PolicyMemento::builder(base.id, base.type_name)
        .maybe_display_name(base.display_name)
        .configs(base.config)
        .attributes(base.attributes)
        .tags(base.tags)
        .flags(map_from_wire(wire.flags, aliases, lookup)?)
        .build())
}
