// ============================================================================
// memento-rebind Library
// ============================================================================
//
// Checkpointing for a live graph of managed objects (entities, locations and
// policies): change tracking, periodic delta persistence, a reference-resolving
// serializer and two-phase reconstruction on restart.

pub mod core;
pub mod memento;
pub mod model;
pub mod rebind;
pub mod serializer;
pub mod storage;

pub use crate::core::{DeferredValue, MementoError, MementoValue, ObjectKind, Result};

pub use memento::{
    BasicMemento, EntityMemento, EntityMementoBuilder, GraphMemento, LocationMemento,
    LocationMementoBuilder, Memento, MementoDelta, PolicyMemento, PolicyMementoBuilder,
};

pub use model::{
    BasicEntity, BasicLocation, BasicPolicy, Entity, EntityRef, Location, LocationRef,
    ObjectRef, Policy, PolicyRef, WeakRef, locations_in_hierarchy, new_object_id,
};

pub use serializer::{
    EncodingFormat, LookupContext, MementoSerializer, PlaceholderLookup, SerializerConfig,
    StaticLookup, TypeAliases,
};

pub use storage::{
    DurabilityMode, FileMementoPersister, FilePersisterOptions, InMemoryMementoPersister,
    MementoPersister,
};

pub use rebind::{
    ChangeListener, DeltaChangeListener, DeltaCollector, DeltaSnapshot, NoopChangeListener,
    PeriodicPersister, PersisterStats, RebindConfig, RebindContext, RebindManager,
    RebindOutcome, RebindProblem, RebindReport, RebindState, RegisteredType,
    TypeRegistry, TypeResolutionMode,
};
