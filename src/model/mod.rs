//! Seams to the managed-object model.
//!
//! The checkpoint core never inspects concrete types: it asks objects for
//! mementos, asks a [`TypeRegistry`](crate::rebind::TypeRegistry) to create
//! instances by type name, and hands each instance its memento back through
//! `reconstruct`.

use std::sync::Arc;

use uuid::Uuid;

use crate::core::Result;
use crate::memento::{EntityMemento, LocationMemento, PolicyMemento};
use crate::rebind::RebindContext;

mod basic;
mod hierarchy;
mod reference;

pub use basic::{BasicEntity, BasicLocation, BasicPolicy};
pub use hierarchy::locations_in_hierarchy;
pub use reference::{EntityRef, LocationRef, ObjectRef, PolicyRef, WeakRef};

pub trait Entity: Send + Sync {
    fn id(&self) -> &str;

    fn type_name(&self) -> &str;

    /// Locations the entity is deployed to; used to capture location changes
    /// alongside entity changes.
    fn locations(&self) -> Vec<Arc<dyn Location>>;

    /// Captures the externalizable state. Relational fields must be read in
    /// one consistent step.
    fn memento(&self) -> Result<EntityMemento>;

    /// Applies a memento onto a freshly created instance during rebind.
    fn reconstruct(&self, context: &RebindContext, memento: &EntityMemento) -> Result<()>;
}

pub trait Location: Send + Sync {
    fn id(&self) -> &str;

    fn type_name(&self) -> &str;

    fn parent(&self) -> Option<Arc<dyn Location>>;

    fn children(&self) -> Vec<Arc<dyn Location>>;

    fn memento(&self) -> Result<LocationMemento>;

    fn reconstruct(&self, context: &RebindContext, memento: &LocationMemento) -> Result<()>;
}

pub trait Policy: Send + Sync {
    fn id(&self) -> &str;

    fn type_name(&self) -> &str;

    fn memento(&self) -> Result<PolicyMemento>;

    fn reconstruct(&self, context: &RebindContext, memento: &PolicyMemento) -> Result<()>;
}

/// Generates a fresh object id. Ids are never reused.
pub fn new_object_id() -> String {
    Uuid::new_v4().to_string()
}
