use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{MementoError, ObjectKind, Result};
use crate::model::{BasicEntity, BasicLocation, BasicPolicy, Entity, Location, Policy};

type EntityFactory = Arc<dyn Fn(&str) -> Arc<dyn Entity> + Send + Sync>;
type LocationFactory = Arc<dyn Fn(&str) -> Arc<dyn Location> + Send + Sync>;
type PolicyFactory = Arc<dyn Fn(&str) -> Arc<dyn Policy> + Send + Sync>;

/// A type name the registry can build, and the kind of object it builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredType {
    pub type_name: String,
    pub kind: ObjectKind,
}

/// Name to factory table supplied by the managed-object model.
///
/// Each factory receives the id to create the instance under.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    entities: HashMap<String, EntityFactory>,
    locations: HashMap<String, LocationFactory>,
    policies: HashMap<String, PolicyFactory>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity<E, F>(&mut self, type_name: impl Into<String>, factory: F) -> &mut Self
    where
        E: Entity + 'static,
        F: Fn(&str) -> Arc<E> + Send + Sync + 'static,
    {
        self.entities.insert(
            type_name.into(),
            Arc::new(move |id: &str| -> Arc<dyn Entity> { factory(id) }),
        );
        self
    }

    pub fn register_location<L, F>(&mut self, type_name: impl Into<String>, factory: F) -> &mut Self
    where
        L: Location + 'static,
        F: Fn(&str) -> Arc<L> + Send + Sync + 'static,
    {
        self.locations.insert(
            type_name.into(),
            Arc::new(move |id: &str| -> Arc<dyn Location> { factory(id) }),
        );
        self
    }

    pub fn register_policy<P, F>(&mut self, type_name: impl Into<String>, factory: F) -> &mut Self
    where
        P: Policy + 'static,
        F: Fn(&str) -> Arc<P> + Send + Sync + 'static,
    {
        self.policies.insert(
            type_name.into(),
            Arc::new(move |id: &str| -> Arc<dyn Policy> { factory(id) }),
        );
        self
    }

    /// Builds `type_name` entities as [`BasicEntity`].
    pub fn with_basic_entity(mut self, type_name: &str) -> Self {
        let name = type_name.to_string();
        self.register_entity(type_name, move |id| BasicEntity::with_id(id, name.as_str()));
        self
    }

    pub fn with_basic_location(mut self, type_name: &str) -> Self {
        let name = type_name.to_string();
        self.register_location(type_name, move |id| BasicLocation::with_id(id, name.as_str()));
        self
    }

    pub fn with_basic_policy(mut self, type_name: &str) -> Self {
        let name = type_name.to_string();
        self.register_policy(type_name, move |id| BasicPolicy::with_id(id, name.as_str()));
        self
    }

    /// Resolves a type name to the kind it builds. Entity registrations win
    /// when a name is registered for more than one kind.
    pub fn load_class(&self, type_name: &str) -> Result<RegisteredType> {
        let kind = if self.entities.contains_key(type_name) {
            ObjectKind::Entity
        } else if self.locations.contains_key(type_name) {
            ObjectKind::Location
        } else if self.policies.contains_key(type_name) {
            ObjectKind::Policy
        } else {
            return Err(MementoError::TypeNotFound(type_name.to_string()));
        };
        Ok(RegisteredType {
            type_name: type_name.to_string(),
            kind,
        })
    }

    pub fn contains(&self, kind: ObjectKind, type_name: &str) -> bool {
        match kind {
            ObjectKind::Entity => self.entities.contains_key(type_name),
            ObjectKind::Location => self.locations.contains_key(type_name),
            ObjectKind::Policy => self.policies.contains_key(type_name),
        }
    }

    pub fn create_entity(&self, type_name: &str, id: &str) -> Result<Arc<dyn Entity>> {
        let factory = self
            .entities
            .get(type_name)
            .ok_or_else(|| MementoError::TypeNotFound(type_name.to_string()))?;
        let entity = factory(id);
        check_created_id(ObjectKind::Entity, id, entity.id())?;
        Ok(entity)
    }

    pub fn create_location(&self, type_name: &str, id: &str) -> Result<Arc<dyn Location>> {
        let factory = self
            .locations
            .get(type_name)
            .ok_or_else(|| MementoError::TypeNotFound(type_name.to_string()))?;
        let location = factory(id);
        check_created_id(ObjectKind::Location, id, location.id())?;
        Ok(location)
    }

    pub fn create_policy(&self, type_name: &str, id: &str) -> Result<Arc<dyn Policy>> {
        let factory = self
            .policies
            .get(type_name)
            .ok_or_else(|| MementoError::TypeNotFound(type_name.to_string()))?;
        let policy = factory(id);
        check_created_id(ObjectKind::Policy, id, policy.id())?;
        Ok(policy)
    }
}

fn check_created_id(kind: ObjectKind, wanted: &str, created: &str) -> Result<()> {
    if wanted != created {
        return Err(MementoError::InvalidState(format!(
            "factory for {} '{}' produced an object with id '{}'",
            kind, wanted, created
        )));
    }
    Ok(())
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entities = self.entities.keys().collect::<Vec<_>>();
        let mut locations = self.locations.keys().collect::<Vec<_>>();
        let mut policies = self.policies.keys().collect::<Vec<_>>();
        entities.sort();
        locations.sort();
        policies.sort();
        f.debug_struct("TypeRegistry")
            .field("entities", &entities)
            .field("locations", &locations)
            .field("policies", &policies)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_registered_types_under_the_requested_id() {
        let registry = TypeRegistry::new()
            .with_basic_entity("App")
            .with_basic_location("Host");

        let app = registry.create_entity("App", "a1").unwrap();
        assert_eq!(app.id(), "a1");
        assert_eq!(app.type_name(), "App");
        assert_eq!(registry.load_class("Host").unwrap().kind, ObjectKind::Location);
    }

    #[test]
    fn unknown_types_are_type_not_found() {
        let registry = TypeRegistry::new().with_basic_entity("App");
        assert!(registry.create_entity("Missing", "x").err().unwrap().is_type_not_found());
        assert!(registry.create_location("App", "x").err().unwrap().is_type_not_found());
        assert!(registry.load_class("Missing").unwrap_err().is_type_not_found());
    }

    #[test]
    fn factory_must_honour_the_id() {
        let mut registry = TypeRegistry::new();
        registry.register_entity("Fixed", |_id| BasicEntity::with_id("always-the-same", "Fixed"));
        let err = registry.create_entity("Fixed", "wanted").err().unwrap();
        assert!(matches!(err, MementoError::InvalidState(_)));
    }
}
