use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{Level, event};

use crate::core::{MementoError, ObjectKind, Result};
use crate::memento::MementoDelta;
use crate::rebind::{DeltaChangeListener, DeltaCollector, DeltaSnapshot};
use crate::storage::MementoPersister;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Point-in-time counters for a [`PeriodicPersister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersisterStats {
    /// Completed cycles, successful or not.
    pub writes: u64,
    pub write_failures: u64,
    pub memento_failures: u64,
    pub running: bool,
    pub has_backend: bool,
}

struct PersisterShared {
    collector: Arc<DeltaCollector>,
    stopped: Arc<AtomicBool>,
    running: AtomicBool,
    backend: RwLock<Option<Arc<dyn MementoPersister>>>,
    writes: watch::Sender<u64>,
    write_failures: AtomicU64,
    memento_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
    cycle: AsyncMutex<()>,
}

impl PersisterShared {
    fn backend(&self) -> Option<Arc<dyn MementoPersister>> {
        self.backend
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.is_stopped() && self.backend().is_some()
    }

    async fn persist_now(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        // One cycle at a time, whether scheduled or called directly.
        let _cycle = self.cycle.lock().await;
        if !self.is_active() {
            return Ok(());
        }
        let Some(backend) = self.backend() else {
            return Ok(());
        };

        let window = self.collector.swap();
        let result = if window.is_empty() {
            event!(Level::TRACE, "no changes to persist since last delta");
            Ok(())
        } else {
            let delta = self.build_delta(window);
            event!(
                Level::DEBUG,
                updated = delta.updated_count(),
                removed = delta.removed_count(),
                "persisting delta"
            );
            // The delta is moved into the write; nothing else holds it.
            backend.delta(delta).await
        };

        self.writes.send_modify(|count| *count += 1);

        match result {
            Ok(()) => Ok(()),
            Err(err) if self.is_active() => {
                self.write_failures.fetch_add(1, Ordering::SeqCst);
                *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
                event!(Level::ERROR, error = %err, "persisting delta failed");
                Err(err)
            }
            Err(err) => {
                event!(Level::DEBUG, error = %err, "persisting failed after stop, ignoring");
                Ok(())
            }
        }
    }

    fn build_delta(&self, window: DeltaSnapshot) -> MementoDelta {
        let mut delta = MementoDelta::new();
        for location in window.locations.values() {
            match location.memento() {
                Ok(memento) => delta.locations.push(memento),
                Err(err) => self.memento_failed(ObjectKind::Location, location.id(), &err),
            }
        }
        for entity in window.entities.values() {
            match entity.memento() {
                Ok(memento) => delta.entities.push(memento),
                Err(err) => self.memento_failed(ObjectKind::Entity, entity.id(), &err),
            }
        }
        for policy in window.policies.values() {
            match policy.memento() {
                Ok(memento) => delta.policies.push(memento),
                Err(err) => self.memento_failed(ObjectKind::Policy, policy.id(), &err),
            }
        }
        delta.removed_entity_ids = window.removed_entity_ids;
        delta.removed_location_ids = window.removed_location_ids;
        delta.removed_policy_ids = window.removed_policy_ids;
        delta
    }

    fn memento_failed(&self, kind: ObjectKind, id: &str, err: &MementoError) {
        self.memento_failures.fetch_add(1, Ordering::SeqCst);
        let err = match err {
            MementoError::MementoGeneration { .. } => err.to_string(),
            other => MementoError::MementoGeneration {
                kind,
                id: id.to_string(),
                reason: other.to_string(),
            }
            .to_string(),
        };
        if self.is_active() {
            event!(Level::WARN, kind = %kind, id = %id, error = %err, "generating memento failed");
        } else {
            event!(Level::DEBUG, kind = %kind, id = %id, error = %err, "generating memento failed after stop");
        }
    }
}

struct Worker {
    stop_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

/// Background task that writes the collected delta once per period.
///
/// Cycles never overlap, whether scheduled or run through `persist_now`.
/// Mutators only ever touch the collector.
pub struct PeriodicPersister {
    shared: Arc<PersisterShared>,
    listener: Arc<DeltaChangeListener>,
    period: Duration,
    runtime: Handle,
    worker: Mutex<Option<Worker>>,
}

impl PeriodicPersister {
    pub fn new(period: Duration, runtime: Handle) -> Self {
        let collector = Arc::new(DeltaCollector::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let listener = Arc::new(DeltaChangeListener::with_stop_flag(
            collector.clone(),
            stopped.clone(),
        ));
        let (writes, _) = watch::channel(0u64);

        Self {
            shared: Arc::new(PersisterShared {
                collector,
                stopped,
                running: AtomicBool::new(false),
                backend: RwLock::new(None),
                writes,
                write_failures: AtomicU64::new(0),
                memento_failures: AtomicU64::new(0),
                last_error: Mutex::new(None),
                cycle: AsyncMutex::new(()),
            }),
            listener,
            period,
            runtime,
            worker: Mutex::new(None),
        }
    }

    /// The listener the managed-object model should report mutations to.
    pub fn listener(&self) -> Arc<DeltaChangeListener> {
        self.listener.clone()
    }

    pub fn collector(&self) -> &Arc<DeltaCollector> {
        &self.shared.collector
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_backend(&self, backend: Option<Arc<dyn MementoPersister>>) {
        *self
            .shared
            .backend
            .write()
            .unwrap_or_else(|e| e.into_inner()) = backend;
    }

    pub fn backend(&self) -> Option<Arc<dyn MementoPersister>> {
        self.shared.backend()
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begins scheduling. Calling it again while running does nothing.
    /// Without a backend, changes accumulate until one is set.
    pub fn start(&self) {
        let mut worker = self.worker();
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        if worker.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let shared = self.shared.clone();
        let period = self.period;
        let join_handle = self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(period) => {
                        // Errors are already recorded and logged; the next
                        // tick still runs.
                        let _ = shared.persist_now().await;
                    }
                }
            }
        });

        *worker = Some(Worker {
            stop_tx,
            join_handle,
        });
        event!(Level::DEBUG, period_ms = period.as_millis() as u64, "periodic persister started");
    }

    /// Cancels scheduling and discards the unwritten window. A write already
    /// in flight finishes on its own; this does not wait for it.
    pub fn stop(&self) {
        let worker = self.worker().take();
        let discarded = self.listener.stop_and_discard();
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            drop(worker.join_handle);
        }
        drop(discarded);
        event!(Level::DEBUG, "periodic persister stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Runs one cycle on the caller's task.
    pub async fn persist_now(&self) -> Result<()> {
        self.shared.persist_now().await
    }

    /// Waits until a cycle that began after this call has completed.
    ///
    /// Returns at once when persistence is inactive. Seeing the counter move
    /// by one is not enough: that cycle may have swapped its window before
    /// the call.
    pub async fn wait_for_pending_complete(&self, timeout: Duration) -> Result<()> {
        let mut writes = self.shared.writes.subscribe();
        let start_count = *writes.borrow();
        let deadline = Instant::now() + timeout;

        loop {
            if !self.shared.is_active() {
                return Ok(());
            }
            if *writes.borrow() > start_count + 1 {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(MementoError::Timeout(format!(
                    "no complete persistence cycle within {}ms",
                    timeout.as_millis()
                )));
            }

            tokio::select! {
                _ = writes.changed() => {}
                _ = sleep(WAIT_POLL_INTERVAL.min(deadline - now)) => {}
            }
        }
    }

    pub fn stats(&self) -> PersisterStats {
        PersisterStats {
            writes: *self.shared.writes.borrow(),
            write_failures: self.shared.write_failures.load(Ordering::SeqCst),
            memento_failures: self.shared.memento_failures.load(Ordering::SeqCst),
            running: self.is_running(),
            has_backend: self.shared.backend().is_some(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for PeriodicPersister {
    fn drop(&mut self) {
        if let Some(worker) = self.worker().take() {
            let _ = worker.stop_tx.send(());
            worker.join_handle.abort();
        }
    }
}
