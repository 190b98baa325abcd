pub mod error;
pub mod types;
pub mod value;

pub use error::{MementoError, Result};
pub use types::ObjectKind;
pub use value::{DeferredValue, MementoValue};
