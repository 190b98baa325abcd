//! Storage backends for checkpointed mementos.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::Result;
use crate::memento::{GraphMemento, MementoDelta};
use crate::serializer::LookupContext;

pub mod memory;
pub mod persistence;

pub use memory::InMemoryMementoPersister;
pub use persistence::{DurabilityMode, FileMementoPersister, FilePersisterOptions};

/// Durable home of the checkpointed graph.
///
/// Written by one periodic persister and read by one rebind at startup;
/// implementations need not support reads racing writes.
#[async_trait]
pub trait MementoPersister: Send + Sync {
    /// Applies one batch: upserts the delta's mementos, then removes its ids.
    async fn delta(&self, delta: MementoDelta) -> Result<()>;

    /// Replaces everything stored with `graph`.
    async fn checkpoint(&self, graph: GraphMemento) -> Result<()>;

    /// Reads the whole stored graph, resolving references through `lookup`.
    async fn load_all(&self, lookup: &dyn LookupContext) -> Result<GraphMemento>;

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Waits for writes accepted so far to reach storage.
    async fn wait_for_writes_completed(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
