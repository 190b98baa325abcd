use serde::{Deserialize, Serialize};
use std::fmt;

/// The three kinds of managed object the checkpoint graph holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Entity,
    Location,
    Policy,
}

impl ObjectKind {
    /// Hydration order: entities reference locations, policies reference neither.
    pub const REBIND_ORDER: [ObjectKind; 3] =
        [ObjectKind::Location, ObjectKind::Entity, ObjectKind::Policy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Location => "location",
            Self::Policy => "policy",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
