//! Periodic delta persistence against a recording backend

use async_trait::async_trait;
use memento_rebind::{
    BasicEntity, ChangeListener, Entity, EntityMemento, GraphMemento, Location, LookupContext,
    Memento, MementoDelta, MementoError, MementoPersister, ObjectKind, PeriodicPersister,
    RebindContext, Result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::sleep;

/// Keeps every delta it is handed; can be told to fail.
#[derive(Default)]
struct RecordingPersister {
    deltas: Mutex<Vec<MementoDelta>>,
    failing: AtomicBool,
}

impl RecordingPersister {
    fn deltas(&self) -> Vec<MementoDelta> {
        self.deltas.lock().unwrap().clone()
    }

    fn entity_ids(delta: &MementoDelta) -> Vec<String> {
        delta.entities.iter().map(|m| m.id().to_string()).collect()
    }
}

#[async_trait]
impl MementoPersister for RecordingPersister {
    async fn delta(&self, delta: MementoDelta) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MementoError::Storage("disk full".to_string()));
        }
        self.deltas.lock().unwrap().push(delta);
        Ok(())
    }

    async fn checkpoint(&self, _graph: GraphMemento) -> Result<()> {
        Ok(())
    }

    async fn load_all(&self, _lookup: &dyn LookupContext) -> Result<GraphMemento> {
        Ok(GraphMemento::new())
    }
}

/// Holds every write until released.
#[derive(Default)]
struct GatedPersister {
    entered: Notify,
    release: Notify,
    deltas: Mutex<Vec<MementoDelta>>,
}

#[async_trait]
impl MementoPersister for GatedPersister {
    async fn delta(&self, delta: MementoDelta) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        self.deltas.lock().unwrap().push(delta);
        Ok(())
    }

    async fn checkpoint(&self, _graph: GraphMemento) -> Result<()> {
        Ok(())
    }

    async fn load_all(&self, _lookup: &dyn LookupContext) -> Result<GraphMemento> {
        Ok(GraphMemento::new())
    }
}

/// Entity whose state cannot be captured.
struct UncapturableEntity;

impl Entity for UncapturableEntity {
    fn id(&self) -> &str {
        "broken"
    }

    fn type_name(&self) -> &str {
        "App"
    }

    fn locations(&self) -> Vec<Arc<dyn Location>> {
        Vec::new()
    }

    fn memento(&self) -> Result<EntityMemento> {
        Err(MementoError::MementoGeneration {
            kind: ObjectKind::Entity,
            id: "broken".to_string(),
            reason: "state is being torn down".to_string(),
        })
    }

    fn reconstruct(&self, _context: &RebindContext, _memento: &EntityMemento) -> Result<()> {
        Ok(())
    }
}

/// Entity that stops the persister while its change is being recorded.
struct StopsPersister {
    persister: Arc<PeriodicPersister>,
}

impl Entity for StopsPersister {
    fn id(&self) -> &str {
        "pre_stop"
    }

    fn type_name(&self) -> &str {
        "App"
    }

    fn locations(&self) -> Vec<Arc<dyn Location>> {
        self.persister.stop();
        Vec::new()
    }

    fn memento(&self) -> Result<EntityMemento> {
        Ok(EntityMemento::builder("pre_stop", "App").build())
    }

    fn reconstruct(&self, _context: &RebindContext, _memento: &EntityMemento) -> Result<()> {
        Ok(())
    }
}

const NEVER: Duration = Duration::from_secs(3600);

fn persister_with_backend(period: Duration) -> (PeriodicPersister, Arc<RecordingPersister>) {
    let persister = PeriodicPersister::new(period, Handle::current());
    let backend = Arc::new(RecordingPersister::default());
    persister.set_backend(Some(backend.clone()));
    (persister, backend)
}

#[tokio::test]
async fn test_delta_carries_changes_and_removals_then_window_is_empty() {
    let (persister, backend) = persister_with_backend(NEVER);
    persister.start();

    let e1 = BasicEntity::with_id("e1", "App");
    let e2 = BasicEntity::with_id("e2", "App");
    e1.manage(persister.listener());
    e2.manage(persister.listener());
    persister.persist_now().await.unwrap();

    e1.set_attribute("state", "running");
    e2.unmanage();
    persister.persist_now().await.unwrap();

    let deltas = backend.deltas();
    assert_eq!(deltas.len(), 2);
    let second = &deltas[1];
    assert_eq!(RecordingPersister::entity_ids(second), vec!["e1"]);
    assert_eq!(
        second.removed_entity_ids.iter().cloned().collect::<Vec<_>>(),
        vec!["e2".to_string()]
    );
    assert_eq!(
        second.entities[0].attributes()["state"].as_str(),
        Some("running")
    );

    // Nothing changed since: the cycle completes without writing.
    persister.persist_now().await.unwrap();
    assert_eq!(backend.deltas().len(), 2);
    assert_eq!(persister.stats().writes, 3);
}

#[tokio::test]
async fn test_stop_discards_window_and_restart_writes_only_new_changes() {
    let (persister, backend) = persister_with_backend(NEVER);
    persister.start();

    let e1 = BasicEntity::with_id("e1", "App");
    e1.manage(persister.listener());
    persister.stop();
    assert!(persister.collector().is_empty());

    // Changes while stopped are not collected.
    e1.set_config("ignored", true);
    assert!(persister.collector().is_empty());

    persister.start();
    let e3 = BasicEntity::with_id("e3", "App");
    e3.manage(persister.listener());
    persister.persist_now().await.unwrap();

    let deltas = backend.deltas();
    assert_eq!(deltas.len(), 1);
    assert_eq!(RecordingPersister::entity_ids(&deltas[0]), vec!["e3"]);
}

#[tokio::test]
async fn test_persist_now_without_backend_keeps_the_window() {
    let persister = PeriodicPersister::new(NEVER, Handle::current());
    persister.start();
    assert!(!persister.is_active());

    let e1 = BasicEntity::with_id("e1", "App");
    e1.manage(persister.listener());
    persister.persist_now().await.unwrap();

    assert!(!persister.collector().is_empty());
    assert_eq!(persister.stats().writes, 0);

    let backend = Arc::new(RecordingPersister::default());
    persister.set_backend(Some(backend.clone()));
    persister.persist_now().await.unwrap();
    assert_eq!(RecordingPersister::entity_ids(&backend.deltas()[0]), vec!["e1"]);
}

#[tokio::test]
async fn test_wait_for_pending_complete_returns_at_once_when_inactive() {
    let (persister, _backend) = persister_with_backend(NEVER);
    persister
        .wait_for_pending_complete(Duration::from_millis(10))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_wait_for_pending_complete_times_out_without_cycles() {
    let (persister, _backend) = persister_with_backend(NEVER);
    persister.start();

    let err = persister
        .wait_for_pending_complete(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, MementoError::Timeout(_)));
}

#[tokio::test]
async fn test_scheduled_cycles_write_changes() {
    let (persister, backend) = persister_with_backend(Duration::from_millis(20));
    persister.start();

    let e1 = BasicEntity::with_id("e1", "App");
    e1.manage(persister.listener());
    persister
        .wait_for_pending_complete(Duration::from_secs(5))
        .await
        .unwrap();

    let written: Vec<String> = backend
        .deltas()
        .iter()
        .flat_map(RecordingPersister::entity_ids)
        .collect();
    assert_eq!(written, vec!["e1"]);
    persister.stop();
    assert!(!persister.is_running());
}

#[tokio::test]
async fn test_write_failure_propagates_while_active_and_not_after_stop() {
    let (persister, backend) = persister_with_backend(NEVER);
    persister.start();
    backend.failing.store(true, Ordering::SeqCst);

    let e1 = BasicEntity::with_id("e1", "App");
    e1.manage(persister.listener());
    let err = persister.persist_now().await.unwrap_err();
    assert!(matches!(err, MementoError::Storage(_)));

    let stats = persister.stats();
    assert_eq!(stats.write_failures, 1);
    assert_eq!(stats.writes, 1);
    assert!(persister.last_error().unwrap().contains("disk full"));

    persister.stop();
    e1.set_config("after", "stop");
    persister.persist_now().await.unwrap();
    assert_eq!(persister.stats().write_failures, 1);
}

#[tokio::test]
async fn test_failed_memento_skips_only_that_object() {
    let (persister, backend) = persister_with_backend(NEVER);
    persister.start();

    let healthy = BasicEntity::with_id("e1", "App");
    healthy.manage(persister.listener());
    persister.listener().on_changed_entity(Arc::new(UncapturableEntity));
    persister.persist_now().await.unwrap();

    let deltas = backend.deltas();
    assert_eq!(deltas.len(), 1);
    assert_eq!(RecordingPersister::entity_ids(&deltas[0]), vec!["e1"]);
    let stats = persister.stats();
    assert_eq!(stats.memento_failures, 1);
    assert_eq!(stats.write_failures, 0);
}

#[tokio::test]
async fn test_change_racing_stop_is_not_written_after_restart() {
    let persister = Arc::new(PeriodicPersister::new(NEVER, Handle::current()));
    let backend = Arc::new(RecordingPersister::default());
    persister.set_backend(Some(backend.clone()));
    persister.start();

    persister.listener().on_changed_entity(Arc::new(StopsPersister {
        persister: persister.clone(),
    }));
    assert!(!persister.is_running());
    assert!(persister.collector().is_empty());

    persister.start();
    persister.persist_now().await.unwrap();
    assert!(backend.deltas().is_empty());
}

#[tokio::test]
async fn test_wait_ignores_the_cycle_already_in_flight() {
    let persister = Arc::new(PeriodicPersister::new(NEVER, Handle::current()));
    let backend = Arc::new(GatedPersister::default());
    persister.set_backend(Some(backend.clone()));
    persister.start();

    let e1 = BasicEntity::with_id("e1", "App");
    e1.manage(persister.listener());
    let in_flight = tokio::spawn({
        let persister = persister.clone();
        async move { persister.persist_now().await }
    });
    backend.entered.notified().await;

    let waiter = tokio::spawn({
        let persister = persister.clone();
        async move {
            persister
                .wait_for_pending_complete(Duration::from_secs(5))
                .await
        }
    });
    sleep(Duration::from_millis(20)).await;

    backend.release.notify_one();
    in_flight.await.unwrap().unwrap();
    sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    persister.persist_now().await.unwrap();
    waiter.await.unwrap().unwrap();
    assert_eq!(backend.deltas.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cycles_run_one_at_a_time() {
    let persister = Arc::new(PeriodicPersister::new(NEVER, Handle::current()));
    let backend = Arc::new(GatedPersister::default());
    persister.set_backend(Some(backend.clone()));
    persister.start();

    let e1 = BasicEntity::with_id("e1", "App");
    e1.manage(persister.listener());
    let first = tokio::spawn({
        let persister = persister.clone();
        async move { persister.persist_now().await }
    });
    backend.entered.notified().await;

    let e2 = BasicEntity::with_id("e2", "App");
    e2.manage(persister.listener());
    let second = tokio::spawn({
        let persister = persister.clone();
        async move { persister.persist_now().await }
    });
    sleep(Duration::from_millis(20)).await;
    // The second cycle has not taken its window while the first is writing.
    assert!(!second.is_finished());
    assert!(!persister.collector().is_empty());

    backend.release.notify_one();
    first.await.unwrap().unwrap();
    backend.entered.notified().await;
    backend.release.notify_one();
    second.await.unwrap().unwrap();

    let written: Vec<Vec<String>> = backend
        .deltas
        .lock()
        .unwrap()
        .iter()
        .map(RecordingPersister::entity_ids)
        .collect();
    assert_eq!(written, vec![vec!["e1".to_string()], vec!["e2".to_string()]]);
}
