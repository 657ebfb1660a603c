//! Membership groups.
//!
//! A [`Group`] holds two sets of units: **children**, which it owns for
//! lifecycle purposes, and **members**, which count towards its size. Every
//! member is normally also a child; a cluster keeps failed units it
//! quarantined as children without counting them.
//!
//! Membership changes are announced to listeners registered on the group
//! and mirrored as the `group.size` sensor on the bus.

mod quarantine;
mod tracker;

pub use quarantine::QuarantineGroup;
pub use tracker::{MembershipListener, MembershipTracker, MembershipTrackerBuilder, TrackerState};

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use flotilla_events::{sensors, SensorBus};
use flotilla_id::{SubscriptionId, UnitId};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::debug;

use crate::location::LocationRef;
use crate::unit::{MemberSet, Startable, Unit, UnitRef};

/// A membership change announced to group listeners.
#[derive(Clone)]
pub enum GroupChange {
    MemberAdded(UnitRef),
    MemberRemoved(UnitRef),
}

impl GroupChange {
    pub fn unit(&self) -> &UnitRef {
        match self {
            GroupChange::MemberAdded(u) | GroupChange::MemberRemoved(u) => u,
        }
    }
}

impl std::fmt::Debug for GroupChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupChange::MemberAdded(u) => write!(f, "MemberAdded({})", u.id()),
            GroupChange::MemberRemoved(u) => write!(f, "MemberRemoved({})", u.id()),
        }
    }
}

pub type GroupListener = Arc<dyn Fn(&GroupChange) + Send + Sync>;

#[derive(Default)]
struct Membership {
    members: HashMap<UnitId, UnitRef>,
    children: HashMap<UnitId, UnitRef>,
    destroyed: bool,
}

/// A named, observable set of units.
pub struct Group {
    id: UnitId,
    name: String,
    bus: Arc<SensorBus>,
    state: RwLock<Membership>,
    listeners: RwLock<HashMap<SubscriptionId, GroupListener>>,

    /// Bus subscription removing units as they are unmanaged.
    lifecycle: Mutex<Option<SubscriptionId>>,

    /// Held while reading and publishing `group.size`, so the last value
    /// published is never older than the last change.
    size_publish: ReentrantMutex<()>,
}

impl Group {
    pub fn new(name: impl Into<String>, bus: Arc<SensorBus>) -> Arc<Self> {
        Self::with_id(UnitId::new(), name, bus)
    }

    /// A group publishing under an existing unit id, such as the cluster
    /// that owns it.
    pub fn with_id(id: UnitId, name: impl Into<String>, bus: Arc<SensorBus>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            bus,
            state: RwLock::new(Membership::default()),
            listeners: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(None),
            size_publish: ReentrantMutex::new(()),
        })
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `unit` as a member (and child). Returns false if it already was
    /// a member or the group is destroyed.
    pub fn add_member(&self, unit: UnitRef) -> bool {
        let id = unit.id();
        let size = {
            let mut state = self.state.write();
            if state.destroyed || state.members.contains_key(&id) {
                return false;
            }
            state.children.insert(id, Arc::clone(&unit));
            state.members.insert(id, Arc::clone(&unit));
            state.members.len()
        };

        debug!(group = %self.name, unit_id = %id, size, "Member added");
        self.announce(GroupChange::MemberAdded(unit));
        true
    }

    /// Remove a member. The unit stays a child and is not stopped.
    pub fn remove_member(&self, id: UnitId) -> bool {
        let (unit, size) = {
            let mut state = self.state.write();
            if state.destroyed {
                return false;
            }
            match state.members.remove(&id) {
                Some(unit) => (unit, state.members.len()),
                None => return false,
            }
        };

        debug!(group = %self.name, unit_id = %id, size, "Member removed");
        self.announce(GroupChange::MemberRemoved(unit));
        true
    }

    pub fn add_child(&self, unit: UnitRef) -> bool {
        let mut state = self.state.write();
        if state.destroyed {
            return false;
        }
        state.children.insert(unit.id(), unit).is_none()
    }

    /// Remove a child, and its membership if it had one.
    pub fn remove_child(&self, id: UnitId) -> bool {
        let was_child = {
            let mut state = self.state.write();
            if state.destroyed {
                return false;
            }
            state.children.remove(&id).is_some()
        };
        let was_member = self.remove_member(id);
        was_child || was_member
    }

    pub fn children(&self) -> Vec<UnitRef> {
        sorted(self.state.read().children.values().cloned().collect())
    }

    pub fn has_child(&self, id: UnitId) -> bool {
        self.state.read().children.contains_key(&id)
    }

    pub fn member_ids(&self) -> Vec<UnitId> {
        self.members().iter().map(|u| u.id()).collect()
    }

    /// Register a membership listener. Listeners run after the group has
    /// released its locks.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&GroupChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.listeners.write().insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    /// Drop any member or child as soon as the registry unmanages it.
    pub fn watch_lifecycle(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            return;
        }

        let weak: Weak<Group> = Arc::downgrade(self);
        let sub = self.bus.subscribe_all(sensors::UNMANAGED, move |event| {
            if let Some(group) = weak.upgrade() {
                group.remove_child(event.unit_id);
            }
        });
        *lifecycle = Some(sub);
    }

    /// Empty the group and ignore every later mutation.
    ///
    /// Remaining members are announced as removed.
    pub fn destroy(&self) {
        let removed: Vec<UnitRef> = {
            let mut state = self.state.write();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.children.clear();
            sorted(state.members.drain().map(|(_, u)| u).collect())
        };

        if let Some(sub) = self.lifecycle.lock().take() {
            self.bus.unsubscribe(sub);
        }

        debug!(group = %self.name, removed = removed.len(), "Group destroyed");
        for unit in removed {
            self.notify(&GroupChange::MemberRemoved(unit));
        }
        self.publish_size();
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.read().destroyed
    }

    fn announce(&self, change: GroupChange) {
        self.notify(&change);
        self.publish_size();
    }

    fn publish_size(&self) {
        let _publishing = self.size_publish.lock();
        let size = self.state.read().members.len();
        self.bus
            .publish(self.id, sensors::GROUP_SIZE, serde_json::json!(size));
    }

    fn notify(&self, change: &GroupChange) {
        let listeners: Vec<GroupListener> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener(change);
        }
    }
}

impl MemberSet for Group {
    fn members(&self) -> Vec<UnitRef> {
        sorted(self.state.read().members.values().cloned().collect())
    }

    fn has_member(&self, id: UnitId) -> bool {
        self.state.read().members.contains_key(&id)
    }

    fn current_size(&self) -> usize {
        self.state.read().members.len()
    }
}

/// A group is a unit so it can be a child of another group.
#[async_trait]
impl Startable for Group {
    async fn start(&self, _locations: &[LocationRef]) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

impl Unit for Group {
    fn id(&self) -> UnitId {
        Group::id(self)
    }

    fn creation_seq(&self) -> u64 {
        0
    }

    fn is_startable(&self) -> bool {
        false
    }

    fn display_name(&self) -> String {
        self.name().to_string()
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        if let Some(sub) = self.lifecycle.get_mut().take() {
            self.bus.unsubscribe(sub);
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("members", &state.members.len())
            .field("children", &state.children.len())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

/// Order units by creation.
fn sorted(mut units: Vec<UnitRef>) -> Vec<UnitRef> {
    units.sort_by_key(|u| u.creation_seq());
    units
}
