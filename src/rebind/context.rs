use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{MementoError, ObjectKind, Result};
use crate::model::{EntityRef, Location, LocationRef, ObjectRef, Entity, Policy, PolicyRef};
use crate::rebind::{RegisteredType, TypeRegistry};
use crate::serializer::{LookupContext, check_declared_type};

enum Handle {
    Entity(EntityRef),
    Location(LocationRef),
    Policy(PolicyRef),
}

impl Handle {
    fn kind(&self) -> ObjectKind {
        match self {
            Self::Entity(_) => ObjectKind::Entity,
            Self::Location(_) => ObjectKind::Location,
            Self::Policy(_) => ObjectKind::Policy,
        }
    }
}

struct Slot {
    handle: Handle,
    /// Set once a loaded memento claims this id.
    has_memento: bool,
}

/// Id-keyed arena for one rebind pass.
///
/// Decoding fills it with placeholders as references are met; registering a
/// memento marks its id as present. During hydration only ids backed by a
/// memento resolve, anything else is a reference to an object that was never
/// checkpointed.
pub struct RebindContext {
    registry: Arc<TypeRegistry>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl RebindContext {
    pub(crate) fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_entity(&self, id: &str) -> Result<EntityRef> {
        match self.registered(ObjectKind::Entity, id)? {
            Handle::Entity(handle) => Ok(handle),
            _ => Err(no_such(ObjectKind::Entity, id)),
        }
    }

    pub fn get_location(&self, id: &str) -> Result<LocationRef> {
        match self.registered(ObjectKind::Location, id)? {
            Handle::Location(handle) => Ok(handle),
            _ => Err(no_such(ObjectKind::Location, id)),
        }
    }

    pub fn get_policy(&self, id: &str) -> Result<PolicyRef> {
        match self.registered(ObjectKind::Policy, id)? {
            Handle::Policy(handle) => Ok(handle),
            _ => Err(no_such(ObjectKind::Policy, id)),
        }
    }

    pub fn load_class(&self, type_name: &str) -> Result<RegisteredType> {
        self.registry.load_class(type_name)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    fn registered(&self, kind: ObjectKind, id: &str) -> Result<Handle> {
        let slots = self.slots();
        match slots.get(id) {
            Some(slot) if slot.has_memento && slot.handle.kind() == kind => {
                Ok(match &slot.handle {
                    Handle::Entity(h) => Handle::Entity(h.clone()),
                    Handle::Location(h) => Handle::Location(h.clone()),
                    Handle::Policy(h) => Handle::Policy(h.clone()),
                })
            }
            _ => Err(no_such(kind, id)),
        }
    }

    /// Claims `id` for a loaded memento, reusing a placeholder created while
    /// decoding when there is one.
    pub(crate) fn register(&self, kind: ObjectKind, id: &str, type_name: &str) -> Result<()> {
        let mut slots = self.slots();
        match slots.get_mut(id) {
            Some(slot) if slot.handle.kind() != kind => Err(kind_clash(id, slot.handle.kind(), kind)),
            Some(slot) if slot.has_memento => Err(MementoError::InvalidState(format!(
                "{} '{}' was loaded twice",
                kind, id
            ))),
            Some(slot) => {
                slot.has_memento = true;
                Ok(())
            }
            None => {
                let handle = match kind {
                    ObjectKind::Entity => Handle::Entity(ObjectRef::placeholder(id, Some(type_name))),
                    ObjectKind::Location => {
                        Handle::Location(ObjectRef::placeholder(id, Some(type_name)))
                    }
                    ObjectKind::Policy => Handle::Policy(ObjectRef::placeholder(id, Some(type_name))),
                };
                slots.insert(
                    id.to_string(),
                    Slot {
                        handle,
                        has_memento: true,
                    },
                );
                Ok(())
            }
        }
    }

    /// Fails on the first (sorted) id that was referenced but never loaded.
    pub(crate) fn verify_references(&self) -> Result<()> {
        let slots = self.slots();
        let mut missing = slots
            .iter()
            .filter(|(_, slot)| !slot.has_memento)
            .map(|(id, slot)| (slot.handle.kind(), id.clone()))
            .collect::<Vec<_>>();
        missing.sort();
        match missing.into_iter().next() {
            Some((kind, id)) => Err(MementoError::NoSuchObject { kind, id }),
            None => Ok(()),
        }
    }

    pub(crate) fn build_entity(&self, type_name: &str, id: &str) -> Result<Arc<dyn Entity>> {
        let entity = self.registry.create_entity(type_name, id)?;
        self.get_entity(id)?.bind(entity.clone())?;
        Ok(entity)
    }

    pub(crate) fn build_location(&self, type_name: &str, id: &str) -> Result<Arc<dyn Location>> {
        let location = self.registry.create_location(type_name, id)?;
        self.get_location(id)?.bind(location.clone())?;
        Ok(location)
    }

    pub(crate) fn build_policy(&self, type_name: &str, id: &str) -> Result<Arc<dyn Policy>> {
        let policy = self.registry.create_policy(type_name, id)?;
        self.get_policy(id)?.bind(policy.clone())?;
        Ok(policy)
    }
}

fn no_such(kind: ObjectKind, id: &str) -> MementoError {
    MementoError::NoSuchObject {
        kind,
        id: id.to_string(),
    }
}

fn kind_clash(id: &str, existing: ObjectKind, wanted: ObjectKind) -> MementoError {
    MementoError::TypeMismatch(format!(
        "id '{}' is a {}, referenced as a {}",
        id, existing, wanted
    ))
}

impl LookupContext for RebindContext {
    fn lookup_entity(&self, expected_type: Option<&str>, id: &str) -> Result<EntityRef> {
        let mut slots = self.slots();
        let slot = slots.entry(id.to_string()).or_insert_with(|| Slot {
            handle: Handle::Entity(ObjectRef::placeholder(id, expected_type)),
            has_memento: false,
        });
        match &slot.handle {
            Handle::Entity(handle) => {
                check_declared_type(ObjectKind::Entity, expected_type, handle)?;
                Ok(handle.clone())
            }
            other => Err(kind_clash(id, other.kind(), ObjectKind::Entity)),
        }
    }

    fn lookup_location(&self, expected_type: Option<&str>, id: &str) -> Result<LocationRef> {
        let mut slots = self.slots();
        let slot = slots.entry(id.to_string()).or_insert_with(|| Slot {
            handle: Handle::Location(ObjectRef::placeholder(id, expected_type)),
            has_memento: false,
        });
        match &slot.handle {
            Handle::Location(handle) => {
                check_declared_type(ObjectKind::Location, expected_type, handle)?;
                Ok(handle.clone())
            }
            other => Err(kind_clash(id, other.kind(), ObjectKind::Location)),
        }
    }
}
