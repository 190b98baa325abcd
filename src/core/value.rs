use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::model::{EntityRef, LocationRef};

/// A config or attribute value captured in a memento.
///
/// References to other managed objects are held as handles and are only ever
/// encoded as their id, never as an embedded object graph.
#[derive(Debug, Clone)]
pub enum MementoValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<MementoValue>),
    Map(BTreeMap<String, MementoValue>),
    Entity(EntityRef),
    Location(LocationRef),
    Deferred(DeferredValue),
}

impl MementoValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Entity(_) => "entityRef",
            Self::Location(_) => "locationRef",
            Self::Deferred(_) => "deferred",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) => {
                if f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Self::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_location(&self) -> Option<&LocationRef> {
        match self {
            Self::Location(location) => Some(location),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Collects the ids of every object referenced from this value, recursively.
    pub fn referenced_ids(&self, entities: &mut Vec<String>, locations: &mut Vec<String>) {
        match self {
            Self::Entity(entity) => entities.push(entity.id().to_string()),
            Self::Location(location) => locations.push(location.id().to_string()),
            Self::List(items) => {
                for item in items {
                    item.referenced_ids(entities, locations);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.referenced_ids(entities, locations);
                }
            }
            Self::Deferred(deferred) => {
                if let Some(value) = deferred.value() {
                    value.referenced_ids(entities, locations);
                }
            }
            _ => {}
        }
    }
}

impl PartialEq for MementoValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => {
                if a.is_nan() && b.is_nan() {
                    return true;
                }
                a == b || (a - b).abs() < f64::EPSILON
            }
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Entity(a), Self::Entity(b)) => a == b,
            (Self::Location(a), Self::Location(b)) => a == b,
            (Self::Deferred(a), Self::Deferred(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for MementoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(fl) => write!(f, "{}", fl),
            Self::Text(s) => write!(f, "{}", s),
            Self::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (idx, (key, value)) in entries.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Self::Entity(entity) => write!(f, "entity({})", entity.id()),
            Self::Location(location) => write!(f, "location({})", location.id()),
            Self::Deferred(deferred) => match deferred.value() {
                Some(value) => write!(f, "{}", value),
                None => write!(f, "<pending>"),
            },
        }
    }
}

impl From<i64> for MementoValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for MementoValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<String> for MementoValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MementoValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<bool> for MementoValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<EntityRef> for MementoValue {
    fn from(entity: EntityRef) -> Self {
        Self::Entity(entity)
    }
}

impl From<LocationRef> for MementoValue {
    fn from(location: LocationRef) -> Self {
        Self::Location(location)
    }
}

impl From<DeferredValue> for MementoValue {
    fn from(deferred: DeferredValue) -> Self {
        Self::Deferred(deferred)
    }
}

impl<T: Into<MementoValue>> From<Vec<T>> for MementoValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

/// A value computed asynchronously, e.g. the result of a task still running.
///
/// Set at most once. Encoding never waits on it: a pending or failed value is
/// written as absent.
#[derive(Debug, Clone, Default)]
pub struct DeferredValue {
    cell: Arc<OnceLock<std::result::Result<MementoValue, String>>>,
}

impl DeferredValue {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn resolved(value: impl Into<MementoValue>) -> Self {
        let deferred = Self::pending();
        deferred.resolve(value);
        deferred
    }

    /// Returns false if the value had already been settled.
    pub fn resolve(&self, value: impl Into<MementoValue>) -> bool {
        self.cell.set(Ok(value.into())).is_ok()
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.cell.set(Err(reason.into())).is_ok()
    }

    pub fn is_done(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The value, only when settled successfully.
    pub fn value(&self) -> Option<&MementoValue> {
        match self.cell.get() {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self.cell.get() {
            Some(Err(reason)) => Some(reason.as_str()),
            _ => None,
        }
    }
}

impl PartialEq for DeferredValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell) || self.cell.get() == other.cell.get()
    }
}
