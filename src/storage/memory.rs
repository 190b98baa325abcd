use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{Level, event};

use crate::core::{MementoError, Result};
use crate::memento::{GraphMemento, Memento, MementoDelta};
use crate::serializer::{LookupContext, MementoSerializer};
use crate::storage::MementoPersister;

/// Encoded mementos, one slot per id and kind.
#[derive(Default)]
struct EncodedStore {
    entities: BTreeMap<String, Vec<u8>>,
    locations: BTreeMap<String, Vec<u8>>,
    policies: BTreeMap<String, Vec<u8>>,
}

/// Keeps every memento encoded in memory.
///
/// Values really go through the serializer, so a rebind from this store
/// exercises the same reference resolution as a durable one. Once stopped,
/// deltas are dropped and loads fail.
pub struct InMemoryMementoPersister {
    serializer: MementoSerializer,
    store: RwLock<EncodedStore>,
    running: AtomicBool,
    deltas: AtomicU64,
}

impl Default for InMemoryMementoPersister {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMementoPersister {
    pub fn new() -> Self {
        Self::with_serializer(MementoSerializer::json())
    }

    pub fn with_serializer(serializer: MementoSerializer) -> Self {
        Self {
            serializer,
            store: RwLock::new(EncodedStore::default()),
            running: AtomicBool::new(true),
            deltas: AtomicU64::new(0),
        }
    }

    pub fn serializer(&self) -> &MementoSerializer {
        &self.serializer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Deltas applied since creation.
    pub fn delta_count(&self) -> u64 {
        self.deltas.load(Ordering::SeqCst)
    }

    pub async fn entity_ids(&self) -> Vec<String> {
        self.store.read().await.entities.keys().cloned().collect()
    }

    pub async fn location_ids(&self) -> Vec<String> {
        self.store.read().await.locations.keys().cloned().collect()
    }

    pub async fn policy_ids(&self) -> Vec<String> {
        self.store.read().await.policies.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        let store = self.store.read().await;
        store.entities.len() + store.locations.len() + store.policies.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MementoPersister for InMemoryMementoPersister {
    async fn delta(&self, delta: MementoDelta) -> Result<()> {
        if !self.is_running() {
            event!(Level::DEBUG, "ignoring delta written after stop");
            return Ok(());
        }

        // Encode everything before touching the store so a bad memento
        // leaves it unchanged.
        let entities = delta
            .entities
            .iter()
            .map(|m| -> Result<(String, Vec<u8>)> {
                Ok((m.id().to_string(), self.serializer.encode_entity(m)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let locations = delta
            .locations
            .iter()
            .map(|m| -> Result<(String, Vec<u8>)> {
                Ok((m.id().to_string(), self.serializer.encode_location(m)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let policies = delta
            .policies
            .iter()
            .map(|m| -> Result<(String, Vec<u8>)> {
                Ok((m.id().to_string(), self.serializer.encode_policy(m)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut store = self.store.write().await;
        store.entities.extend(entities);
        store.locations.extend(locations);
        store.policies.extend(policies);
        for id in &delta.removed_entity_ids {
            store.entities.remove(id);
        }
        for id in &delta.removed_location_ids {
            store.locations.remove(id);
        }
        for id in &delta.removed_policy_ids {
            store.policies.remove(id);
        }
        self.deltas.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn checkpoint(&self, graph: GraphMemento) -> Result<()> {
        if !self.is_running() {
            event!(Level::DEBUG, "ignoring checkpoint written after stop");
            return Ok(());
        }

        let mut fresh = EncodedStore::default();
        for (id, memento) in &graph.entities {
            fresh
                .entities
                .insert(id.clone(), self.serializer.encode_entity(memento)?);
        }
        for (id, memento) in &graph.locations {
            fresh
                .locations
                .insert(id.clone(), self.serializer.encode_location(memento)?);
        }
        for (id, memento) in &graph.policies {
            fresh
                .policies
                .insert(id.clone(), self.serializer.encode_policy(memento)?);
        }
        *self.store.write().await = fresh;
        Ok(())
    }

    async fn load_all(&self, lookup: &dyn LookupContext) -> Result<GraphMemento> {
        if !self.is_running() {
            return Err(MementoError::InvalidState(
                "in-memory persister has been stopped".to_string(),
            ));
        }

        let store = self.store.read().await;
        let mut graph = GraphMemento::new();
        for bytes in store.entities.values() {
            graph.insert_entity(self.serializer.decode_entity(bytes, lookup)?);
        }
        for bytes in store.locations.values() {
            graph.insert_location(self.serializer.decode_location(bytes, lookup)?);
        }
        for bytes in store.policies.values() {
            graph.insert_policy(self.serializer.decode_policy(bytes, lookup)?);
        }
        Ok(graph)
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
