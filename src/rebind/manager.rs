use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::{Instrument, Level, event, info_span};

use crate::core::{MementoError, ObjectKind, Result};
use crate::memento::{GraphMemento, Memento};
use crate::model::{Entity, Location, Policy};
use crate::rebind::{
    ChangeListener, NoopChangeListener, PeriodicPersister, PersisterStats, RebindConfig,
    RebindContext, TypeRegistry, TypeResolutionMode,
};
use crate::storage::MementoPersister;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebindState {
    Idle,
    Loading,
    PlaceholdersBuilt,
    Hydrating,
    Complete,
    Failed,
}

impl RebindState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Loading => "LOADING",
            Self::PlaceholdersBuilt => "PLACEHOLDERS_BUILT",
            Self::Hydrating => "HYDRATING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for RebindState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An object skipped by a lenient rebind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebindProblem {
    pub kind: ObjectKind,
    pub id: String,
    pub type_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebindReport {
    pub state: RebindState,
    pub entities: usize,
    pub locations: usize,
    pub policies: usize,
    pub applications: usize,
    pub problems: Vec<RebindProblem>,
    pub failure: Option<String>,
    pub elapsed: Duration,
}

impl RebindReport {
    fn new() -> Self {
        Self {
            state: RebindState::Idle,
            entities: 0,
            locations: 0,
            policies: 0,
            applications: 0,
            problems: Vec::new(),
            failure: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// A completed rebind: the live graph plus its report.
pub struct RebindOutcome {
    /// Top-level entities, in id order.
    pub applications: Vec<Arc<dyn Entity>>,
    pub entities: BTreeMap<String, Arc<dyn Entity>>,
    pub locations: BTreeMap<String, Arc<dyn Location>>,
    pub policies: BTreeMap<String, Arc<dyn Policy>>,
    pub report: RebindReport,
}

impl RebindOutcome {
    pub fn entity(&self, id: &str) -> Option<&Arc<dyn Entity>> {
        self.entities.get(id)
    }

    pub fn location(&self, id: &str) -> Option<&Arc<dyn Location>> {
        self.locations.get(id)
    }

    pub fn policy(&self, id: &str) -> Option<&Arc<dyn Policy>> {
        self.policies.get(id)
    }
}

/// Clears the in-progress flag when a rebind ends, including when its
/// future is dropped mid-await.
struct RebindingGuard<'a>(&'a AtomicBool);

impl Drop for RebindingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns checkpointing for one management-plane instance: the periodic
/// persister during normal running, and reconstruction on restart.
pub struct RebindManager {
    config: RebindConfig,
    registry: Arc<TypeRegistry>,
    persister: RwLock<Option<Arc<dyn MementoPersister>>>,
    periodic: PeriodicPersister,
    state: Mutex<RebindState>,
    last_report: Mutex<Option<RebindReport>>,
    rebinding: AtomicBool,
}

impl RebindManager {
    /// `runtime` hosts the periodic persistence task.
    pub fn new(config: RebindConfig, registry: TypeRegistry, runtime: Handle) -> Self {
        let periodic = PeriodicPersister::new(config.persist_period(), runtime);
        Self {
            config,
            registry: Arc::new(registry),
            persister: RwLock::new(None),
            periodic,
            state: Mutex::new(RebindState::Idle),
            last_report: Mutex::new(None),
            rebinding: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RebindConfig {
        &self.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn set_persister(&self, persister: Option<Arc<dyn MementoPersister>>) {
        *self.persister.write().unwrap_or_else(|e| e.into_inner()) = persister.clone();
        self.periodic.set_backend(persister);
    }

    pub fn persister(&self) -> Option<Arc<dyn MementoPersister>> {
        self.persister
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The listener managed objects should report to. With persistence
    /// disabled this is a listener that drops everything.
    pub fn change_listener(&self) -> Arc<dyn ChangeListener> {
        if self.config.persistence_enabled {
            self.periodic.listener()
        } else {
            Arc::new(NoopChangeListener)
        }
    }

    pub fn periodic(&self) -> &PeriodicPersister {
        &self.periodic
    }

    pub fn start(&self) {
        if !self.config.persistence_enabled {
            event!(Level::DEBUG, "persistence disabled, not starting periodic persister");
            return;
        }
        self.periodic.start();
    }

    /// Stops periodic persistence and drops the unwritten window. The
    /// storage backend is left running.
    pub fn stop(&self) {
        self.periodic.stop();
    }

    /// Stops periodic persistence, then the storage backend.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop();
        match self.persister() {
            Some(persister) => persister.stop().await,
            None => Ok(()),
        }
    }

    pub async fn persist_now(&self) -> Result<()> {
        self.periodic.persist_now().await
    }

    pub async fn wait_for_pending_complete(&self, timeout: Duration) -> Result<()> {
        self.periodic.wait_for_pending_complete(timeout).await
    }

    pub fn persister_stats(&self) -> PersisterStats {
        self.periodic.stats()
    }

    pub fn rebind_state(&self) -> RebindState {
        *self.state()
    }

    /// State the most recent rebind ended in; `Idle` if none has run.
    pub fn last_rebind_state(&self) -> RebindState {
        self.last_rebind_report()
            .map(|report| report.state)
            .unwrap_or(RebindState::Idle)
    }

    pub fn last_rebind_report(&self) -> Option<RebindReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rebuilds the persisted graph and returns its top-level entities.
    pub async fn rebind(&self) -> Result<Vec<Arc<dyn Entity>>> {
        Ok(self.rebind_detailed().await?.applications)
    }

    /// Rebinds with a different type registry than the one configured.
    pub async fn rebind_with_registry(&self, registry: TypeRegistry) -> Result<Vec<Arc<dyn Entity>>> {
        Ok(self.execute(Arc::new(registry)).await?.applications)
    }

    pub async fn rebind_detailed(&self) -> Result<RebindOutcome> {
        self.execute(self.registry.clone()).await
    }

    fn state(&self) -> MutexGuard<'_, RebindState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, next: RebindState) {
        let mut state = self.state();
        let previous = *state;
        event!(Level::DEBUG, from = %previous, to = %next, "rebind state change");
        *state = next;
    }

    async fn execute(&self, registry: Arc<TypeRegistry>) -> Result<RebindOutcome> {
        if self.rebinding.swap(true, Ordering::SeqCst) {
            return Err(MementoError::InvalidState(
                "a rebind is already in progress".to_string(),
            ));
        }

        let _guard = RebindingGuard(&self.rebinding);
        let span = info_span!("rebind", mode = ?self.config.type_resolution);
        self.run_passes(registry).instrument(span).await
    }

    async fn run_passes(&self, registry: Arc<TypeRegistry>) -> Result<RebindOutcome> {
        let started = Instant::now();
        let mut report = RebindReport::new();
        self.enter(RebindState::Idle);

        let backend = self.persister().ok_or_else(|| {
            MementoError::InvalidState("rebind requires a persister".to_string())
        })?;
        let context = RebindContext::new(registry);

        self.enter(RebindState::Loading);
        let graph = match backend.load_all(&context).await {
            Ok(graph) => graph,
            Err(err) => return Err(self.fail(RebindState::Loading, err, report, started)),
        };
        if let Err(err) = register_placeholders(&context, &graph) {
            return Err(self.fail(RebindState::Loading, err, report, started));
        }
        self.enter(RebindState::PlaceholdersBuilt);
        event!(Level::DEBUG, placeholders = context.len(), "placeholders built");

        self.enter(RebindState::Hydrating);
        match self.hydrate(&context, &graph, &mut report) {
            Ok((applications, entities, locations, policies)) => {
                report.state = RebindState::Complete;
                report.entities = entities.len();
                report.locations = locations.len();
                report.policies = policies.len();
                report.applications = applications.len();
                report.elapsed = started.elapsed();
                self.enter(RebindState::Complete);
                self.store_report(report.clone());
                event!(
                    Level::INFO,
                    entities = report.entities,
                    locations = report.locations,
                    policies = report.policies,
                    applications = report.applications,
                    problems = report.problems.len(),
                    "rebind complete"
                );
                Ok(RebindOutcome {
                    applications,
                    entities,
                    locations,
                    policies,
                    report,
                })
            }
            Err(err) => Err(self.fail(RebindState::Hydrating, err, report, started)),
        }
    }

    #[allow(clippy::type_complexity)]
    fn hydrate(
        &self,
        context: &RebindContext,
        graph: &GraphMemento,
        report: &mut RebindReport,
    ) -> Result<(
        Vec<Arc<dyn Entity>>,
        BTreeMap<String, Arc<dyn Entity>>,
        BTreeMap<String, Arc<dyn Location>>,
        BTreeMap<String, Arc<dyn Policy>>,
    )> {
        context.verify_references()?;
        let strict = self.config.type_resolution == TypeResolutionMode::Strict;

        let mut locations = BTreeMap::new();
        for (id, memento) in &graph.locations {
            let built = context.build_location(memento.type_name(), id);
            if let Some(location) = self.accept(built, memento, strict, report)? {
                locations.insert(id.clone(), location);
            }
        }
        let mut entities = BTreeMap::new();
        for (id, memento) in &graph.entities {
            let built = context.build_entity(memento.type_name(), id);
            if let Some(entity) = self.accept(built, memento, strict, report)? {
                entities.insert(id.clone(), entity);
            }
        }
        let mut policies = BTreeMap::new();
        for (id, memento) in &graph.policies {
            let built = context.build_policy(memento.type_name(), id);
            if let Some(policy) = self.accept(built, memento, strict, report)? {
                policies.insert(id.clone(), policy);
            }
        }

        // Every instance exists before any is reconstructed, so handles
        // captured during reconstruction are already bound.
        for (id, memento) in &graph.locations {
            if let Some(location) = locations.get(id) {
                location.reconstruct(context, memento)?;
            }
        }
        for (id, memento) in &graph.entities {
            if let Some(entity) = entities.get(id) {
                entity.reconstruct(context, memento)?;
            }
        }
        for (id, memento) in &graph.policies {
            if let Some(policy) = policies.get(id) {
                policy.reconstruct(context, memento)?;
            }
        }

        let applications = graph
            .entities
            .values()
            .filter(|memento| memento.is_application())
            .filter_map(|memento| entities.get(memento.id()).cloned())
            .collect();
        Ok((applications, entities, locations, policies))
    }

    /// Lenient mode turns a missing type into a recorded problem.
    fn accept<T: ?Sized>(
        &self,
        built: Result<Arc<T>>,
        memento: &impl Memento,
        strict: bool,
        report: &mut RebindReport,
    ) -> Result<Option<Arc<T>>> {
        match built {
            Ok(object) => Ok(Some(object)),
            Err(err) if err.is_type_not_found() && !strict => {
                event!(
                    Level::WARN,
                    kind = %memento.kind(),
                    id = %memento.id(),
                    type_name = %memento.type_name(),
                    "type not found, skipping object"
                );
                report.problems.push(RebindProblem {
                    kind: memento.kind(),
                    id: memento.id().to_string(),
                    type_name: memento.type_name().to_string(),
                    reason: err.to_string(),
                });
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn fail(
        &self,
        stage: RebindState,
        err: MementoError,
        mut report: RebindReport,
        started: Instant,
    ) -> MementoError {
        event!(Level::ERROR, stage = %stage, error = %err, "rebind failed");
        report.state = RebindState::Failed;
        report.failure = Some(err.to_string());
        report.elapsed = started.elapsed();
        self.enter(RebindState::Failed);
        self.store_report(report);
        MementoError::RebindFailed {
            stage: stage.to_string(),
            source: Box::new(err),
        }
    }

    fn store_report(&self, report: RebindReport) {
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
    }
}

fn register_placeholders(context: &RebindContext, graph: &GraphMemento) -> Result<()> {
    for (id, memento) in &graph.locations {
        context.register(ObjectKind::Location, id, memento.type_name())?;
    }
    for (id, memento) in &graph.entities {
        context.register(ObjectKind::Entity, id, memento.type_name())?;
    }
    for (id, memento) in &graph.policies {
        context.register(ObjectKind::Policy, id, memento.type_name())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memento::{EntityMemento, MementoDelta};
    use crate::serializer::LookupContext;
    use crate::storage::InMemoryMementoPersister;
    use async_trait::async_trait;

    fn manager(registry: TypeRegistry) -> RebindManager {
        RebindManager::new(RebindConfig::default(), registry, Handle::current())
    }

    #[tokio::test]
    async fn rebind_without_persister_is_rejected() {
        let manager = manager(TypeRegistry::new());
        let err = manager.rebind().await.err().unwrap();
        assert!(matches!(err, MementoError::InvalidState(_)));
        assert_eq!(manager.last_rebind_state(), RebindState::Idle);
    }

    #[tokio::test]
    async fn empty_store_rebinds_to_nothing() {
        let manager = manager(TypeRegistry::new());
        manager.set_persister(Some(Arc::new(InMemoryMementoPersister::new())));

        let applications = manager.rebind().await.unwrap();
        assert!(applications.is_empty());
        assert_eq!(manager.last_rebind_state(), RebindState::Complete);
        assert_eq!(manager.rebind_state(), RebindState::Complete);
    }

    #[tokio::test]
    async fn disabled_persistence_hands_out_a_noop_listener() {
        let manager = RebindManager::new(
            RebindConfig::default().with_persistence_enabled(false),
            TypeRegistry::new().with_basic_entity("App"),
            Handle::current(),
        );
        manager.set_persister(Some(Arc::new(InMemoryMementoPersister::new())));
        manager.start();

        let app = crate::model::BasicEntity::with_id("app", "App");
        app.manage(manager.change_listener());
        app.set_attribute("up", true);

        assert!(manager.periodic().collector().is_empty());
        assert!(!manager.persister_stats().running);
    }

    #[tokio::test]
    async fn missing_type_fails_in_hydrating_when_strict() {
        let backend = Arc::new(InMemoryMementoPersister::new());
        let mut graph = GraphMemento::new();
        graph.insert_entity(EntityMemento::builder("app", "Unknown").build());
        backend.checkpoint(graph).await.unwrap();

        let manager = RebindManager::new(
            RebindConfig::default().with_type_resolution(TypeResolutionMode::Strict),
            TypeRegistry::new(),
            Handle::current(),
        );
        manager.set_persister(Some(backend));

        let err = manager.rebind().await.err().unwrap();
        assert!(err.is_type_not_found());
        assert!(matches!(
            err,
            MementoError::RebindFailed { ref stage, .. } if stage == "HYDRATING"
        ));
        let report = manager.last_rebind_report().unwrap();
        assert_eq!(report.state, RebindState::Failed);
        assert!(report.failure.is_some());
    }

    /// Backend whose load never completes.
    struct StalledPersister;

    #[async_trait]
    impl MementoPersister for StalledPersister {
        async fn delta(&self, _delta: MementoDelta) -> Result<()> {
            Ok(())
        }

        async fn checkpoint(&self, _graph: GraphMemento) -> Result<()> {
            Ok(())
        }

        async fn load_all(&self, _lookup: &dyn LookupContext) -> Result<GraphMemento> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn abandoned_rebind_does_not_block_the_next_one() {
        let manager = manager(TypeRegistry::new());
        manager.set_persister(Some(Arc::new(StalledPersister)));
        let abandoned = tokio::time::timeout(Duration::from_millis(20), manager.rebind()).await;
        assert!(abandoned.is_err());

        manager.set_persister(Some(Arc::new(InMemoryMementoPersister::new())));
        let applications = manager.rebind().await.unwrap();
        assert!(applications.is_empty());
        assert_eq!(manager.last_rebind_state(), RebindState::Complete);
    }
}
