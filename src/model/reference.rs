use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use crate::core::{MementoError, Result};
use crate::model::{Entity, Location, Policy};

struct RefSlot<T: ?Sized> {
    id: String,
    declared_type: Option<String>,
    target: OnceLock<Arc<T>>,
}

/// Handle to a managed object, addressed by id.
///
/// A handle is either created resolved (pointing at a live object) or as a
/// placeholder that is bound exactly once when the object it stands for is
/// built. Clones share the same slot, so binding is visible through every
/// copy handed out before the object existed.
pub struct ObjectRef<T: ?Sized> {
    slot: Arc<RefSlot<T>>,
}

pub type EntityRef = ObjectRef<dyn Entity>;
pub type LocationRef = ObjectRef<dyn Location>;
pub type PolicyRef = ObjectRef<dyn Policy>;

impl<T: ?Sized> ObjectRef<T> {
    pub fn placeholder(id: impl Into<String>, declared_type: Option<&str>) -> Self {
        Self {
            slot: Arc::new(RefSlot {
                id: id.into(),
                declared_type: declared_type.map(str::to_string),
                target: OnceLock::new(),
            }),
        }
    }

    pub fn resolved(id: impl Into<String>, declared_type: Option<&str>, target: Arc<T>) -> Self {
        let reference = Self::placeholder(id, declared_type);
        let _ = reference.slot.target.set(target);
        reference
    }

    pub fn id(&self) -> &str {
        &self.slot.id
    }

    pub fn declared_type(&self) -> Option<&str> {
        self.slot.declared_type.as_deref()
    }

    /// The live object, once built.
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.target.get().cloned()
    }

    pub fn is_built(&self) -> bool {
        self.slot.target.get().is_some()
    }

    /// True when both handles share one slot (not merely the same id).
    pub fn same_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// A non-owning copy. The target is captured as it is now; a placeholder
    /// bound later is not seen through the weak copy.
    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef {
            id: self.slot.id.clone(),
            declared_type: self.slot.declared_type.clone(),
            target: self.slot.target.get().map(Arc::downgrade),
        }
    }

    pub(crate) fn bind(&self, target: Arc<T>) -> Result<()> {
        self.slot.target.set(target).map_err(|_| {
            MementoError::InvalidState(format!("object '{}' is already bound", self.slot.id))
        })
    }
}

impl ObjectRef<dyn Entity> {
    pub fn to(entity: Arc<dyn Entity>) -> Self {
        let id = entity.id().to_string();
        let type_name = entity.type_name().to_string();
        Self::resolved(id, Some(&type_name), entity)
    }
}

impl ObjectRef<dyn Location> {
    pub fn to(location: Arc<dyn Location>) -> Self {
        let id = location.id().to_string();
        let type_name = location.type_name().to_string();
        Self::resolved(id, Some(&type_name), location)
    }
}

impl ObjectRef<dyn Policy> {
    pub fn to(policy: Arc<dyn Policy>) -> Self {
        let id = policy.id().to_string();
        let type_name = policy.type_name().to_string();
        Self::resolved(id, Some(&type_name), policy)
    }
}

/// Non-owning reference for back-links such as a child's parent, so a
/// subtree does not keep its ancestors alive.
pub struct WeakRef<T: ?Sized> {
    id: String,
    declared_type: Option<String>,
    target: Option<Weak<T>>,
}

impl<T: ?Sized> WeakRef<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.target.as_ref().and_then(Weak::upgrade)
    }

    /// An owning handle: resolved while the target lives, else a placeholder.
    pub fn to_ref(&self) -> ObjectRef<T> {
        match self.get() {
            Some(target) => ObjectRef::resolved(self.id.clone(), self.declared_type.as_deref(), target),
            None => ObjectRef::placeholder(self.id.clone(), self.declared_type.as_deref()),
        }
    }
}

impl<T: ?Sized> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            declared_type: self.declared_type.clone(),
            target: self.target.clone(),
        }
    }
}

impl<T: ?Sized> Clone for ObjectRef<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: ?Sized> PartialEq for ObjectRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot.id == other.slot.id
    }
}

impl<T: ?Sized> Eq for ObjectRef<T> {}

impl<T: ?Sized> fmt::Debug for ObjectRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.slot.id)
            .field("declared_type", &self.slot.declared_type)
            .field("built", &self.is_built())
            .finish()
    }
}
