use crate::core::types::ObjectKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MementoError {
    #[error("Failed to generate memento for {kind} '{id}': {reason}")]
    MementoGeneration {
        kind: ObjectKind,
        id: String,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Malformed encoding: {0}")]
    Encoding(String),

    #[error("No {kind} with id '{id}'")]
    NoSuchObject { kind: ObjectKind, id: String },

    #[error("Type '{0}' is not registered")]
    TypeNotFound(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Rebind failed while {stage}: {source}")]
    RebindFailed {
        stage: String,
        #[source]
        source: Box<MementoError>,
    },
}

impl MementoError {
    /// True for the reference-resolution class of failures.
    pub fn is_no_such_object(&self) -> bool {
        match self {
            Self::NoSuchObject { .. } => true,
            Self::RebindFailed { source, .. } => source.is_no_such_object(),
            _ => false,
        }
    }

    /// True for the class-resolution class of failures.
    pub fn is_type_not_found(&self) -> bool {
        match self {
            Self::TypeNotFound(_) => true,
            Self::RebindFailed { source, .. } => source.is_type_not_found(),
            _ => false,
        }
    }

    pub fn is_encoding(&self) -> bool {
        match self {
            Self::Encoding(_) => true,
            Self::RebindFailed { source, .. } => source.is_encoding(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MementoError>;

impl<T> From<std::sync::PoisonError<T>> for MementoError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for MementoError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_wrapped_rebind_failures() {
        let err = MementoError::RebindFailed {
            stage: "hydrating".to_string(),
            source: Box::new(MementoError::NoSuchObject {
                kind: ObjectKind::Location,
                id: "loc-1".to_string(),
            }),
        };
        assert!(err.is_no_such_object());
        assert!(!err.is_type_not_found());
        assert!(err.to_string().contains("No location with id 'loc-1'"));
    }

    #[test]
    fn malformed_encoding_is_distinct_from_missing_objects() {
        let err = MementoError::Encoding("unexpected end of input".to_string());
        assert!(err.is_encoding());
        assert!(!err.is_no_such_object());
    }
}
