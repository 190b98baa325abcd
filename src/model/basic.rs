use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crate::core::{MementoValue, Result};
use crate::memento::{EntityMemento, LocationMemento, Memento, PolicyMemento};
use crate::model::{
    Entity, EntityRef, Location, LocationRef, ObjectRef, Policy, PolicyRef, WeakRef,
    new_object_id,
};
use crate::rebind::{ChangeListener, RebindContext};

type SharedListener = RwLock<Option<Arc<dyn ChangeListener>>>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn ref_ids<T: ?Sized>(refs: &[ObjectRef<T>]) -> Vec<String> {
    refs.iter().map(|r| r.id().to_string()).collect()
}

#[derive(Default)]
struct CommonState {
    display_name: Option<String>,
    config: BTreeMap<String, MementoValue>,
    attributes: BTreeMap<String, MementoValue>,
    tags: BTreeSet<String>,
}

impl CommonState {
    fn restore(&mut self, memento: &impl Memento) {
        self.display_name = memento.display_name().map(str::to_string);
        self.config = memento.config().clone();
        self.attributes = memento.attributes().clone();
        self.tags = memento.tags().clone();
    }
}

// ============================================================================
// BasicEntity
// ============================================================================

#[derive(Default)]
struct EntityState {
    common: CommonState,
    parent: Option<WeakRef<dyn Entity>>,
    children: Vec<EntityRef>,
    locations: Vec<LocationRef>,
    policies: Vec<PolicyRef>,
    enrichers: Vec<PolicyRef>,
    application: Option<WeakRef<dyn Entity>>,
}

/// General-purpose entity holding its state in memory.
///
/// Every mutation notifies the attached [`ChangeListener`]; the state lock is
/// released before the listener runs.
pub struct BasicEntity {
    id: String,
    type_name: String,
    state: RwLock<EntityState>,
    listener: SharedListener,
    me: Weak<BasicEntity>,
}

impl BasicEntity {
    pub fn new(type_name: impl Into<String>) -> Arc<Self> {
        Self::with_id(new_object_id(), type_name)
    }

    pub fn with_id(id: impl Into<String>, type_name: impl Into<String>) -> Arc<Self> {
        let id = id.into();
        let type_name = type_name.into();
        Arc::new_cyclic(|me| Self {
            id,
            type_name,
            state: RwLock::new(EntityState::default()),
            listener: RwLock::new(None),
            me: me.clone(),
        })
    }

    fn as_dyn(&self) -> Option<Arc<dyn Entity>> {
        self.me.upgrade().map(|me| me as Arc<dyn Entity>)
    }

    fn changed(&self) {
        let listener = read(&self.listener).clone();
        if let (Some(listener), Some(me)) = (listener, self.as_dyn()) {
            listener.on_changed_entity(me);
        }
    }

    /// Starts reporting mutations to `listener`.
    pub fn manage(&self, listener: Arc<dyn ChangeListener>) {
        *write(&self.listener) = Some(listener.clone());
        if let Some(me) = self.as_dyn() {
            listener.on_managed_entity(me);
        }
    }

    /// Reports removal and stops reporting further mutations.
    pub fn unmanage(&self) {
        let listener = write(&self.listener).take();
        if let (Some(listener), Some(me)) = (listener, self.as_dyn()) {
            listener.on_unmanaged_entity(me);
        }
    }

    pub fn display_name(&self) -> Option<String> {
        read(&self.state).common.display_name.clone()
    }

    pub fn set_display_name(&self, display_name: impl Into<String>) {
        write(&self.state).common.display_name = Some(display_name.into());
        self.changed();
    }

    pub fn config(&self, key: &str) -> Option<MementoValue> {
        read(&self.state).common.config.get(key).cloned()
    }

    pub fn set_config(&self, key: impl Into<String>, value: impl Into<MementoValue>) {
        write(&self.state)
            .common
            .config
            .insert(key.into(), value.into());
        self.changed();
    }

    pub fn attribute(&self, key: &str) -> Option<MementoValue> {
        read(&self.state).common.attributes.get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<MementoValue>) {
        write(&self.state)
            .common
            .attributes
            .insert(key.into(), value.into());
        self.changed();
    }

    pub fn add_tag(&self, tag: impl Into<String>) {
        write(&self.state).common.tags.insert(tag.into());
        self.changed();
    }

    pub fn parent(&self) -> Option<EntityRef> {
        read(&self.state).parent.as_ref().map(WeakRef::to_ref)
    }

    pub fn children(&self) -> Vec<EntityRef> {
        read(&self.state).children.clone()
    }

    pub fn application(&self) -> Option<EntityRef> {
        read(&self.state).application.as_ref().map(WeakRef::to_ref)
    }

    pub fn location_refs(&self) -> Vec<LocationRef> {
        read(&self.state).locations.clone()
    }

    pub fn policies(&self) -> Vec<PolicyRef> {
        read(&self.state).policies.clone()
    }

    pub fn enrichers(&self) -> Vec<PolicyRef> {
        read(&self.state).enrichers.clone()
    }

    /// Links `child` under `parent`; the child joins the parent's application.
    pub fn add_child(parent: &Arc<BasicEntity>, child: &Arc<BasicEntity>) {
        let application = {
            let parent_state = read(&parent.state);
            parent_state
                .application
                .clone()
                .unwrap_or_else(|| EntityRef::to(parent.clone()).downgrade())
        };
        {
            let mut child_state = write(&child.state);
            child_state.parent = Some(EntityRef::to(parent.clone()).downgrade());
            child_state.application = Some(application);
        }
        write(&parent.state)
            .children
            .push(EntityRef::to(child.clone()));
        parent.changed();
        child.changed();
    }

    pub fn add_location(&self, location: Arc<dyn Location>) {
        write(&self.state).locations.push(LocationRef::to(location));
        self.changed();
    }

    pub fn add_policy(&self, policy: Arc<dyn Policy>) {
        write(&self.state).policies.push(PolicyRef::to(policy));
        self.changed();
    }

    pub fn add_enricher(&self, enricher: Arc<dyn Policy>) {
        write(&self.state).enrichers.push(PolicyRef::to(enricher));
        self.changed();
    }
}

impl Entity for BasicEntity {
    fn id(&self) -> &str {
        &self.id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn locations(&self) -> Vec<Arc<dyn Location>> {
        read(&self.state)
            .locations
            .iter()
            .filter_map(|location| location.get())
            .collect()
    }

    fn memento(&self) -> Result<EntityMemento> {
        let state = read(&self.state);
        Ok(EntityMemento::builder(self.id.clone(), self.type_name.clone())
            .maybe_display_name(state.common.display_name.clone())
            .configs(state.common.config.clone())
            .attributes(state.common.attributes.clone())
            .tags(state.common.tags.iter().cloned())
            .parent_id(state.parent.as_ref().map(|p| p.id().to_string()))
            .children_ids(state.children.iter().map(|c| c.id().to_string()))
            .location_ids(state.locations.iter().map(|l| l.id().to_string()))
            .policy_ids(ref_ids(&state.policies))
            .enricher_ids(ref_ids(&state.enrichers))
            .application_id(state.application.as_ref().map(|a| a.id().to_string()))
            .build())
    }

    fn reconstruct(&self, context: &RebindContext, memento: &EntityMemento) -> Result<()> {
        let parent = memento
            .parent_id()
            .map(|id| context.get_entity(id))
            .transpose()?;
        let application = memento
            .application_id()
            .map(|id| context.get_entity(id))
            .transpose()?;
        let children = memento
            .children_ids()
            .iter()
            .map(|id| context.get_entity(id))
            .collect::<Result<Vec<_>>>()?;
        let locations = memento
            .location_ids()
            .iter()
            .map(|id| context.get_location(id))
            .collect::<Result<Vec<_>>>()?;
        let policies = memento
            .policy_ids()
            .iter()
            .map(|id| context.get_policy(id))
            .collect::<Result<Vec<_>>>()?;
        let enrichers = memento
            .enricher_ids()
            .iter()
            .map(|id| context.get_policy(id))
            .collect::<Result<Vec<_>>>()?;

        let mut state = write(&self.state);
        state.common.restore(memento);
        state.parent = parent.as_ref().map(EntityRef::downgrade);
        state.application = application.as_ref().map(EntityRef::downgrade);
        state.children = children;
        state.locations = locations;
        state.policies = policies;
        state.enrichers = enrichers;
        Ok(())
    }
}

// ============================================================================
// BasicLocation
// ============================================================================

#[derive(Default)]
struct LocationState {
    common: CommonState,
    parent: Option<WeakRef<dyn Location>>,
    children: Vec<LocationRef>,
}

/// General-purpose location. Locations do not report their own changes; they
/// are captured whenever an entity deployed to their hierarchy changes.
pub struct BasicLocation {
    id: String,
    type_name: String,
    state: RwLock<LocationState>,
    listener: SharedListener,
    me: Weak<BasicLocation>,
}

impl BasicLocation {
    pub fn new(type_name: impl Into<String>) -> Arc<Self> {
        Self::with_id(new_object_id(), type_name)
    }

    pub fn with_id(id: impl Into<String>, type_name: impl Into<String>) -> Arc<Self> {
        let id = id.into();
        let type_name = type_name.into();
        Arc::new_cyclic(|me| Self {
            id,
            type_name,
            state: RwLock::new(LocationState::default()),
            listener: RwLock::new(None),
            me: me.clone(),
        })
    }

    fn as_dyn(&self) -> Option<Arc<dyn Location>> {
        self.me.upgrade().map(|me| me as Arc<dyn Location>)
    }

    pub fn manage(&self, listener: Arc<dyn ChangeListener>) {
        *write(&self.listener) = Some(listener.clone());
        if let Some(me) = self.as_dyn() {
            listener.on_managed_location(me);
        }
    }

    pub fn unmanage(&self) {
        let listener = write(&self.listener).take();
        if let (Some(listener), Some(me)) = (listener, self.as_dyn()) {
            listener.on_unmanaged_location(me);
        }
    }

    pub fn display_name(&self) -> Option<String> {
        read(&self.state).common.display_name.clone()
    }

    pub fn set_display_name(&self, display_name: impl Into<String>) {
        write(&self.state).common.display_name = Some(display_name.into());
    }

    pub fn config(&self, key: &str) -> Option<MementoValue> {
        read(&self.state).common.config.get(key).cloned()
    }

    pub fn set_config(&self, key: impl Into<String>, value: impl Into<MementoValue>) {
        write(&self.state)
            .common
            .config
            .insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<MementoValue> {
        read(&self.state).common.attributes.get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<MementoValue>) {
        write(&self.state)
            .common
            .attributes
            .insert(key.into(), value.into());
    }

    pub fn parent_ref(&self) -> Option<LocationRef> {
        read(&self.state).parent.as_ref().map(WeakRef::to_ref)
    }

    pub fn children_refs(&self) -> Vec<LocationRef> {
        read(&self.state).children.clone()
    }

    pub fn add_child(parent: &Arc<BasicLocation>, child: &Arc<BasicLocation>) {
        write(&child.state).parent = Some(LocationRef::to(parent.clone()).downgrade());
        write(&parent.state)
            .children
            .push(LocationRef::to(child.clone()));
    }
}

impl Location for BasicLocation {
    fn id(&self) -> &str {
        &self.id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn parent(&self) -> Option<Arc<dyn Location>> {
        read(&self.state).parent.as_ref().and_then(WeakRef::get)
    }

    fn children(&self) -> Vec<Arc<dyn Location>> {
        read(&self.state)
            .children
            .iter()
            .filter_map(|c| c.get())
            .collect()
    }

    fn memento(&self) -> Result<LocationMemento> {
        let state = read(&self.state);
        Ok(LocationMemento::builder(self.id.clone(), self.type_name.clone())
            .maybe_display_name(state.common.display_name.clone())
            .configs(state.common.config.clone())
            .attributes(state.common.attributes.clone())
            .tags(state.common.tags.iter().cloned())
            .parent_id(state.parent.as_ref().map(|p| p.id().to_string()))
            .children_ids(state.children.iter().map(|c| c.id().to_string()))
            .build())
    }

    fn reconstruct(&self, context: &RebindContext, memento: &LocationMemento) -> Result<()> {
        let parent = memento
            .parent_id()
            .map(|id| context.get_location(id))
            .transpose()?;
        let children = memento
            .children_ids()
            .iter()
            .map(|id| context.get_location(id))
            .collect::<Result<Vec<_>>>()?;

        let mut state = write(&self.state);
        state.common.restore(memento);
        state.parent = parent.as_ref().map(LocationRef::downgrade);
        state.children = children;
        Ok(())
    }
}

// ============================================================================
// BasicPolicy
// ============================================================================

#[derive(Default)]
struct PolicyState {
    common: CommonState,
    flags: BTreeMap<String, MementoValue>,
}

pub struct BasicPolicy {
    id: String,
    type_name: String,
    state: RwLock<PolicyState>,
    listener: SharedListener,
    me: Weak<BasicPolicy>,
}

impl BasicPolicy {
    pub fn new(type_name: impl Into<String>) -> Arc<Self> {
        Self::with_id(new_object_id(), type_name)
    }

    pub fn with_id(id: impl Into<String>, type_name: impl Into<String>) -> Arc<Self> {
        let id = id.into();
        let type_name = type_name.into();
        Arc::new_cyclic(|me| Self {
            id,
            type_name,
            state: RwLock::new(PolicyState::default()),
            listener: RwLock::new(None),
            me: me.clone(),
        })
    }

    fn as_dyn(&self) -> Option<Arc<dyn Policy>> {
        self.me.upgrade().map(|me| me as Arc<dyn Policy>)
    }

    fn changed(&self) {
        let listener = read(&self.listener).clone();
        if let (Some(listener), Some(me)) = (listener, self.as_dyn()) {
            listener.on_changed_policy(me);
        }
    }

    pub fn manage(&self, listener: Arc<dyn ChangeListener>) {
        *write(&self.listener) = Some(listener.clone());
        if let Some(me) = self.as_dyn() {
            listener.on_managed_policy(me);
        }
    }

    pub fn unmanage(&self) {
        let listener = write(&self.listener).take();
        if let (Some(listener), Some(me)) = (listener, self.as_dyn()) {
            listener.on_unmanaged_policy(me);
        }
    }

    pub fn display_name(&self) -> Option<String> {
        read(&self.state).common.display_name.clone()
    }

    pub fn set_display_name(&self, display_name: impl Into<String>) {
        write(&self.state).common.display_name = Some(display_name.into());
        self.changed();
    }

    pub fn flag(&self, key: &str) -> Option<MementoValue> {
        read(&self.state).flags.get(key).cloned()
    }

    pub fn set_flag(&self, key: impl Into<String>, value: impl Into<MementoValue>) {
        write(&self.state).flags.insert(key.into(), value.into());
        self.changed();
    }

    pub fn config(&self, key: &str) -> Option<MementoValue> {
        read(&self.state).common.config.get(key).cloned()
    }

    pub fn set_config(&self, key: impl Into<String>, value: impl Into<MementoValue>) {
        write(&self.state)
            .common
            .config
            .insert(key.into(), value.into());
        self.changed();
    }

    pub fn attribute(&self, key: &str) -> Option<MementoValue> {
        read(&self.state).common.attributes.get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<MementoValue>) {
        write(&self.state)
            .common
            .attributes
            .insert(key.into(), value.into());
        self.changed();
    }
}

impl Policy for BasicPolicy {
    fn id(&self) -> &str {
        &self.id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn memento(&self) -> Result<PolicyMemento> {
        let state = read(&self.state);
        Ok(PolicyMemento::builder(self.id.clone(), self.type_name.clone())
            .maybe_display_name(state.common.display_name.clone())
            .configs(state.common.config.clone())
            .attributes(state.common.attributes.clone())
            .tags(state.common.tags.iter().cloned())
            .flags(state.flags.clone())
            .build())
    }

    fn reconstruct(&self, _context: &RebindContext, memento: &PolicyMemento) -> Result<()> {
        let mut state = write(&self.state);
        state.common.restore(memento);
        state.flags = memento.flags().clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memento_is_stable_for_unchanged_entity() {
        let app = BasicEntity::with_id("app", "App");
        let web = BasicEntity::with_id("web", "WebCluster");
        let host = BasicLocation::with_id("host", "Host");
        let scaler = BasicPolicy::with_id("scaler", "AutoScaler");
        BasicEntity::add_child(&app, &web);
        web.add_location(host.clone());
        web.add_policy(scaler.clone());
        web.set_attribute("service.up", true);
        web.set_config("peer", EntityRef::to(app.clone()));

        let first = web.memento().unwrap();
        let second = web.memento().unwrap();
        assert_eq!(first, second);

        assert_eq!(first.parent_id(), Some("app"));
        assert_eq!(first.application_id(), Some("app"));
        assert_eq!(first.location_ids(), ["host".to_string()]);
        assert_eq!(first.policy_ids(), ["scaler".to_string()]);
        assert_eq!(
            first.config().get("peer").and_then(|v| v.as_entity()).map(|r| r.id()),
            Some("app")
        );
        assert_eq!(app.memento().unwrap().children_ids(), ["web".to_string()]);
    }

    #[test]
    fn location_memento_captures_tree_links() {
        let region = BasicLocation::with_id("region", "Region");
        let zone = BasicLocation::with_id("zone", "Zone");
        BasicLocation::add_child(&region, &zone);

        assert_eq!(zone.memento().unwrap().parent_id(), Some("region"));
        assert_eq!(region.memento().unwrap().children_ids(), ["zone".to_string()]);
    }

    #[test]
    fn policy_memento_carries_flags() {
        let policy = BasicPolicy::with_id("p1", "Restarter");
        policy.set_flag("maxRestarts", 3i64);
        policy.set_display_name("restarter");

        let memento = policy.memento().unwrap();
        assert_eq!(memento.flags().get("maxRestarts"), Some(&MementoValue::Integer(3)));
        assert_eq!(memento.display_name(), Some("restarter"));
    }

    #[test]
    fn children_do_not_keep_their_parent_alive() {
        let app = BasicEntity::with_id("app", "App");
        let web = BasicEntity::with_id("web", "WebCluster");
        BasicEntity::add_child(&app, &web);
        assert_eq!(web.parent().unwrap().get().unwrap().id(), "app");

        let app_alive = Arc::downgrade(&app);
        let web_alive = Arc::downgrade(&web);
        drop(app);
        assert!(app_alive.upgrade().is_none());

        // The links are still written by id after the parent is gone.
        let memento = web.memento().unwrap();
        assert_eq!(memento.parent_id(), Some("app"));
        assert_eq!(memento.application_id(), Some("app"));
        assert!(!web.parent().unwrap().is_built());

        drop(web);
        assert!(web_alive.upgrade().is_none());
    }
}
