use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{Level, event};

use crate::model::{Entity, Location, Policy, locations_in_hierarchy};
use crate::rebind::{DeltaCollector, DeltaSnapshot};

/// Mutation hooks the managed-object model calls on the mutator's thread.
///
/// Implementations must return quickly and must not block on I/O.
pub trait ChangeListener: Send + Sync {
    fn on_managed_entity(&self, entity: Arc<dyn Entity>);
    fn on_changed_entity(&self, entity: Arc<dyn Entity>);
    fn on_unmanaged_entity(&self, entity: Arc<dyn Entity>);

    fn on_managed_location(&self, location: Arc<dyn Location>);
    fn on_changed_location(&self, location: Arc<dyn Location>);
    fn on_unmanaged_location(&self, location: Arc<dyn Location>);

    fn on_managed_policy(&self, policy: Arc<dyn Policy>);
    fn on_changed_policy(&self, policy: Arc<dyn Policy>);
    fn on_unmanaged_policy(&self, policy: Arc<dyn Policy>);
}

/// Listener that ignores everything; installed while persistence is off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChangeListener;

impl ChangeListener for NoopChangeListener {
    fn on_managed_entity(&self, _entity: Arc<dyn Entity>) {}
    fn on_changed_entity(&self, _entity: Arc<dyn Entity>) {}
    fn on_unmanaged_entity(&self, _entity: Arc<dyn Entity>) {}
    fn on_managed_location(&self, _location: Arc<dyn Location>) {}
    fn on_changed_location(&self, _location: Arc<dyn Location>) {}
    fn on_unmanaged_location(&self, _location: Arc<dyn Location>) {}
    fn on_managed_policy(&self, _policy: Arc<dyn Policy>) {}
    fn on_changed_policy(&self, _policy: Arc<dyn Policy>) {}
    fn on_unmanaged_policy(&self, _policy: Arc<dyn Policy>) {}
}

/// Feeds notifications into a [`DeltaCollector`].
///
/// An entity change also marks every location in the hierarchy of each
/// location the entity is deployed to. Locations have no change hook of
/// their own in the basic model, so this is how their state gets written.
#[derive(Debug, Clone)]
pub struct DeltaChangeListener {
    collector: Arc<DeltaCollector>,
    stopped: Arc<AtomicBool>,
}

impl DeltaChangeListener {
    pub fn new(collector: Arc<DeltaCollector>) -> Self {
        Self::with_stop_flag(collector, Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn with_stop_flag(collector: Arc<DeltaCollector>, stopped: Arc<AtomicBool>) -> Self {
        Self { collector, stopped }
    }

    pub fn collector(&self) -> &Arc<DeltaCollector> {
        &self.collector
    }

    pub fn stop(&self) {
        let _window = self.collector.lock();
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Sets the stop flag and empties the window under one collector lock,
    /// so no notification can land between the two.
    pub(crate) fn stop_and_discard(&self) -> DeltaSnapshot {
        let mut window = self.collector.lock();
        self.stopped.store(true, Ordering::SeqCst);
        mem::take(&mut *window)
    }

    /// Applies `record` to the window unless stopped. The flag is checked
    /// again under the lock because `stop` may land while the caller was
    /// gathering what to record.
    fn record(&self, record: impl FnOnce(&mut DeltaSnapshot)) {
        let mut window = self.collector.lock();
        if self.is_stopped() {
            return;
        }
        record(&mut window);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl ChangeListener for DeltaChangeListener {
    fn on_managed_entity(&self, entity: Arc<dyn Entity>) {
        self.on_changed_entity(entity);
    }

    fn on_changed_entity(&self, entity: Arc<dyn Entity>) {
        if self.is_stopped() {
            return;
        }
        event!(Level::TRACE, entity_id = %entity.id(), "entity changed");

        let locations = entity
            .locations()
            .iter()
            .flat_map(locations_in_hierarchy)
            .collect::<Vec<_>>();

        self.record(|window| {
            window.add_entity(entity);
            for location in locations {
                window.add_location(location);
            }
        });
    }

    fn on_unmanaged_entity(&self, entity: Arc<dyn Entity>) {
        if self.is_stopped() {
            return;
        }
        event!(Level::TRACE, entity_id = %entity.id(), "entity unmanaged");
        self.record(|window| window.remove_entity(entity.id()));
    }

    fn on_managed_location(&self, location: Arc<dyn Location>) {
        self.on_changed_location(location);
    }

    fn on_changed_location(&self, location: Arc<dyn Location>) {
        if self.is_stopped() {
            return;
        }
        event!(Level::TRACE, location_id = %location.id(), "location changed");
        self.record(|window| window.add_location(location));
    }

    fn on_unmanaged_location(&self, location: Arc<dyn Location>) {
        if self.is_stopped() {
            return;
        }
        event!(Level::TRACE, location_id = %location.id(), "location unmanaged");
        self.record(|window| window.remove_location(location.id()));
    }

    fn on_managed_policy(&self, policy: Arc<dyn Policy>) {
        self.on_changed_policy(policy);
    }

    fn on_changed_policy(&self, policy: Arc<dyn Policy>) {
        if self.is_stopped() {
            return;
        }
        event!(Level::TRACE, policy_id = %policy.id(), "policy changed");
        self.record(|window| window.add_policy(policy));
    }

    fn on_unmanaged_policy(&self, policy: Arc<dyn Policy>) {
        if self.is_stopped() {
            return;
        }
        event!(Level::TRACE, policy_id = %policy.id(), "policy unmanaged");
        self.record(|window| window.remove_policy(policy.id()));
    }
}
