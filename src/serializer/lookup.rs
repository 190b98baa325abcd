use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::{MementoError, ObjectKind, Result};
use crate::model::{EntityRef, LocationRef, ObjectRef};

/// Resolves ids found in an encoded document back to object handles.
///
/// Supplied per decode call. Implementations return the live object when it
/// exists, or a placeholder standing in for an object not yet built.
pub trait LookupContext: Send + Sync {
    fn lookup_entity(&self, expected_type: Option<&str>, id: &str) -> Result<EntityRef>;

    fn lookup_location(&self, expected_type: Option<&str>, id: &str) -> Result<LocationRef>;
}

pub(crate) fn check_declared_type<T: ?Sized>(
    kind: ObjectKind,
    expected_type: Option<&str>,
    found: &ObjectRef<T>,
) -> Result<()> {
    match (expected_type, found.declared_type()) {
        (Some(expected), Some(actual)) if expected != actual => {
            Err(MementoError::TypeMismatch(format!(
                "{} '{}' is a '{}', not a '{}'",
                kind,
                found.id(),
                actual,
                expected
            )))
        }
        _ => Ok(()),
    }
}

/// Lookup over a fixed table of handles. Unknown ids fail with
/// [`MementoError::NoSuchObject`].
#[derive(Debug, Default, Clone)]
pub struct StaticLookup {
    entities: HashMap<String, EntityRef>,
    locations: HashMap<String, LocationRef>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: EntityRef) -> Self {
        self.entities.insert(entity.id().to_string(), entity);
        self
    }

    pub fn with_location(mut self, location: LocationRef) -> Self {
        self.locations.insert(location.id().to_string(), location);
        self
    }
}

impl LookupContext for StaticLookup {
    fn lookup_entity(&self, expected_type: Option<&str>, id: &str) -> Result<EntityRef> {
        let found = self
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| MementoError::NoSuchObject {
                kind: ObjectKind::Entity,
                id: id.to_string(),
            })?;
        check_declared_type(ObjectKind::Entity, expected_type, &found)?;
        Ok(found)
    }

    fn lookup_location(&self, expected_type: Option<&str>, id: &str) -> Result<LocationRef> {
        let found = self
            .locations
            .get(id)
            .cloned()
            .ok_or_else(|| MementoError::NoSuchObject {
                kind: ObjectKind::Location,
                id: id.to_string(),
            })?;
        check_declared_type(ObjectKind::Location, expected_type, &found)?;
        Ok(found)
    }
}

/// Lookup that never fails: every id resolves to a cached placeholder.
///
/// Meant for inspecting stored documents without a live graph.
#[derive(Debug, Default)]
pub struct PlaceholderLookup {
    entities: Mutex<HashMap<String, EntityRef>>,
    locations: Mutex<HashMap<String, LocationRef>>,
}

impl PlaceholderLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids = self
            .entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn location_ids(&self) -> Vec<String> {
        let mut ids = self
            .locations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

impl LookupContext for PlaceholderLookup {
    fn lookup_entity(&self, expected_type: Option<&str>, id: &str) -> Result<EntityRef> {
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entities
            .entry(id.to_string())
            .or_insert_with(|| ObjectRef::placeholder(id, expected_type))
            .clone())
    }

    fn lookup_location(&self, expected_type: Option<&str>, id: &str) -> Result<LocationRef> {
        let mut locations = self.locations.lock().unwrap_or_else(|e| e.into_inner());
        Ok(locations
            .entry(id.to_string())
            .or_insert_with(|| ObjectRef::placeholder(id, expected_type))
            .clone())
    }
}
