//! Change tracking, periodic persistence and two-phase reconstruction.

mod config;
mod context;
mod delta;
mod listener;
mod manager;
mod periodic;
mod registry;

pub use config::{RebindConfig, TypeResolutionMode};
pub use context::RebindContext;
pub use delta::{DeltaCollector, DeltaSnapshot};
pub use listener::{ChangeListener, DeltaChangeListener, NoopChangeListener};
pub use manager::{RebindManager, RebindOutcome, RebindProblem, RebindReport, RebindState};
pub use periodic::{PeriodicPersister, PersisterStats};
pub use registry::{RegisteredType, TypeRegistry};
