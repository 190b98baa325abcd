//! Encoding of mementos, deltas and checkpoints.
//!
//! References to managed objects are written as ids and resolved through a
//! [`LookupContext`] on the way back in. Type names can be shortened with
//! [`TypeAliases`] so documents stay readable and survive type renames.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{MementoError, Result};
use crate::memento::{EntityMemento, GraphMemento, LocationMemento, MementoDelta, PolicyMemento};

mod lookup;
pub(crate) mod wire;

pub use lookup::{LookupContext, PlaceholderLookup, StaticLookup};
pub(crate) use lookup::check_declared_type;

use wire::{DocumentKind, WireDocument, WireGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingFormat {
    #[default]
    Json,
    #[serde(alias = "msgpack")]
    MessagePack,
}

impl EncodingFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MessagePack => "msgpack",
        }
    }
}

impl fmt::Display for EncodingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncodingFormat {
    type Err = MementoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::MessagePack),
            other => Err(MementoError::Encoding(format!(
                "unknown encoding format '{}'",
                other
            ))),
        }
    }
}

/// Bidirectional map between full type names and their short aliases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeAliases {
    by_type: BTreeMap<String, String>,
}

impl TypeAliases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `alias` for `type_name`, replacing any previous alias.
    pub fn alias(&mut self, type_name: impl Into<String>, alias: impl Into<String>) -> &mut Self {
        self.by_type.insert(type_name.into(), alias.into());
        self
    }

    pub fn with_alias(mut self, type_name: impl Into<String>, alias: impl Into<String>) -> Self {
        self.alias(type_name, alias);
        self
    }

    pub fn encode_name<'a>(&'a self, type_name: &'a str) -> &'a str {
        self.by_type
            .get(type_name)
            .map(String::as_str)
            .unwrap_or(type_name)
    }

    /// Unknown names pass through unchanged.
    pub fn decode_name(&self, name: &str) -> String {
        self.by_type
            .iter()
            .find(|(_, alias)| alias.as_str() == name)
            .map(|(type_name, _)| type_name.clone())
            .unwrap_or_else(|| name.to_string())
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerConfig {
    pub format: EncodingFormat,
    pub aliases: TypeAliases,
}

impl SerializerConfig {
    pub fn with_format(mut self, format: EncodingFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_aliases(mut self, aliases: TypeAliases) -> Self {
        self.aliases = aliases;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct MementoSerializer {
    config: SerializerConfig,
}

impl MementoSerializer {
    pub fn new(config: SerializerConfig) -> Self {
        Self { config }
    }

    pub fn json() -> Self {
        Self::new(SerializerConfig::default())
    }

    pub fn message_pack() -> Self {
        Self::new(SerializerConfig::default().with_format(EncodingFormat::MessagePack))
    }

    pub fn format(&self) -> EncodingFormat {
        self.config.format
    }

    pub fn aliases(&self) -> &TypeAliases {
        &self.config.aliases
    }

    pub fn encode_entity(&self, memento: &EntityMemento) -> Result<Vec<u8>> {
        self.to_bytes(&wire::entity_to_wire(memento, self.aliases()))
    }

    pub fn decode_entity(&self, bytes: &[u8], lookup: &dyn LookupContext) -> Result<EntityMemento> {
        wire::entity_from_wire(self.from_bytes(bytes)?, self.aliases(), lookup)
    }

    pub fn encode_location(&self, memento: &LocationMemento) -> Result<Vec<u8>> {
        self.to_bytes(&wire::location_to_wire(memento, self.aliases()))
    }

    pub fn decode_location(
        &self,
        bytes: &[u8],
        lookup: &dyn LookupContext,
    ) -> Result<LocationMemento> {
        wire::location_from_wire(self.from_bytes(bytes)?, self.aliases(), lookup)
    }

    pub fn encode_policy(&self, memento: &PolicyMemento) -> Result<Vec<u8>> {
        self.to_bytes(&wire::policy_to_wire(memento, self.aliases()))
    }

    pub fn decode_policy(&self, bytes: &[u8], lookup: &dyn LookupContext) -> Result<PolicyMemento> {
        wire::policy_from_wire(self.from_bytes(bytes)?, self.aliases(), lookup)
    }

    pub fn encode_delta(&self, delta: &MementoDelta) -> Result<Vec<u8>> {
        self.encode_document(&wire::delta_to_wire(delta, self.aliases()))
    }

    pub fn decode_delta(&self, bytes: &[u8], lookup: &dyn LookupContext) -> Result<MementoDelta> {
        let document = self.decode_document(bytes)?;
        if document.kind != DocumentKind::Delta {
            return Err(MementoError::Encoding(
                "expected a delta document, found a checkpoint".to_string(),
            ));
        }

        let mut delta = MementoDelta::new();
        for entity in document.entities {
            delta
                .entities
                .push(wire::entity_from_wire(entity, self.aliases(), lookup)?);
        }
        for location in document.locations {
            delta
                .locations
                .push(wire::location_from_wire(location, self.aliases(), lookup)?);
        }
        for policy in document.policies {
            delta
                .policies
                .push(wire::policy_from_wire(policy, self.aliases(), lookup)?);
        }
        delta.removed_entity_ids = document.removed_entity_ids;
        delta.removed_location_ids = document.removed_location_ids;
        delta.removed_policy_ids = document.removed_policy_ids;
        Ok(delta)
    }

    pub fn encode_checkpoint(&self, graph: &GraphMemento) -> Result<Vec<u8>> {
        let mut document = WireDocument::new(DocumentKind::Checkpoint);
        document.entities = graph
            .entities
            .values()
            .map(|m| wire::entity_to_wire(m, self.aliases()))
            .collect();
        document.locations = graph
            .locations
            .values()
            .map(|m| wire::location_to_wire(m, self.aliases()))
            .collect();
        document.policies = graph
            .policies
            .values()
            .map(|m| wire::policy_to_wire(m, self.aliases()))
            .collect();
        self.encode_document(&document)
    }

    /// Decodes either document kind into the graph it describes.
    pub fn decode_graph(&self, bytes: &[u8], lookup: &dyn LookupContext) -> Result<GraphMemento> {
        let mut folded = WireGraph::default();
        folded.apply(self.decode_document(bytes)?);
        self.graph_from_wire(folded, lookup)
    }

    pub(crate) fn encode_document(&self, document: &WireDocument) -> Result<Vec<u8>> {
        self.to_bytes(document)
    }

    pub(crate) fn decode_document(&self, bytes: &[u8]) -> Result<WireDocument> {
        let document: WireDocument = self.from_bytes(bytes)?;
        document.check_version()?;
        Ok(document)
    }

    pub(crate) fn graph_from_wire(
        &self,
        folded: WireGraph,
        lookup: &dyn LookupContext,
    ) -> Result<GraphMemento> {
        let mut graph = GraphMemento::new();
        for entity in folded.entities.into_values() {
            graph.insert_entity(wire::entity_from_wire(entity, self.aliases(), lookup)?);
        }
        for location in folded.locations.into_values() {
            graph.insert_location(wire::location_from_wire(location, self.aliases(), lookup)?);
        }
        for policy in folded.policies.into_values() {
            graph.insert_policy(wire::policy_from_wire(policy, self.aliases(), lookup)?);
        }
        Ok(graph)
    }

    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self.config.format {
            EncodingFormat::Json => serde_json::to_vec(value)
                .map_err(|e| MementoError::Encoding(format!("json encode: {}", e))),
            EncodingFormat::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| MementoError::Encoding(format!("msgpack encode: {}", e))),
        }
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self.config.format {
            EncodingFormat::Json => serde_json::from_slice(bytes)
                .map_err(|e| MementoError::Encoding(format!("json decode: {}", e))),
            EncodingFormat::MessagePack => rmp_serde::from_slice(bytes)
                .map_err(|e| MementoError::Encoding(format!("msgpack decode: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MementoValue;
    use crate::memento::Memento;
    use crate::model::ObjectRef;

    #[test]
    fn aliases_round_trip_and_pass_unknown_names() {
        let aliases = TypeAliases::new().with_alias("org.example.Cluster", "cluster");
        assert_eq!(aliases.encode_name("org.example.Cluster"), "cluster");
        assert_eq!(aliases.encode_name("Other"), "Other");
        assert_eq!(aliases.decode_name("cluster"), "org.example.Cluster");
        assert_eq!(aliases.decode_name("Other"), "Other");
    }

    #[test]
    fn format_parses_both_spellings() {
        assert_eq!("json".parse::<EncodingFormat>().unwrap(), EncodingFormat::Json);
        assert_eq!(
            "MsgPack".parse::<EncodingFormat>().unwrap(),
            EncodingFormat::MessagePack
        );
        assert!("xml".parse::<EncodingFormat>().is_err());
    }

    #[test]
    fn malformed_input_is_an_encoding_error() {
        let serializer = MementoSerializer::json();
        let err = serializer
            .decode_entity(b"{not json", &StaticLookup::new())
            .unwrap_err();
        assert!(err.is_encoding());

        let err = MementoSerializer::message_pack()
            .decode_delta(&[0xc1, 0x00], &StaticLookup::new())
            .unwrap_err();
        assert!(err.is_encoding());
    }

    #[test]
    fn unknown_reference_fails_with_no_such_object() {
        let serializer = MementoSerializer::json();
        let memento = EntityMemento::builder("e1", "App")
            .config("peer", MementoValue::Entity(ObjectRef::placeholder("e2", None)))
            .build();
        let bytes = serializer.encode_entity(&memento).unwrap();

        let err = serializer
            .decode_entity(&bytes, &StaticLookup::new())
            .unwrap_err();
        assert!(err.is_no_such_object());

        let lookup = StaticLookup::new().with_entity(ObjectRef::placeholder("e2", None));
        let decoded = serializer.decode_entity(&bytes, &lookup).unwrap();
        assert_eq!(decoded.config()["peer"].as_entity().map(|e| e.id()), Some("e2"));
    }

    #[test]
    fn decode_delta_rejects_checkpoints() {
        let serializer = MementoSerializer::json();
        let bytes = serializer.encode_checkpoint(&GraphMemento::new()).unwrap();
        assert!(serializer
            .decode_delta(&bytes, &StaticLookup::new())
            .unwrap_err()
            .is_encoding());
        assert!(serializer
            .decode_graph(&bytes, &StaticLookup::new())
            .unwrap()
            .is_empty());
    }
}
