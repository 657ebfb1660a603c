//! Membership tracking.
//!
//! A [`MembershipTracker`] follows a group and reports, through a
//! [`MembershipListener`], every member joining or leaving and every change
//! of a tracked sensor on any member.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use flotilla_events::{sensors, SensorBus, SensorEvent};
use flotilla_id::{SubscriptionId, UnitId};
use parking_lot::Mutex;
use tracing::debug;

use super::{Group, GroupChange};
use crate::unit::{MemberSet, UnitRef};

/// Callbacks invoked by a [`MembershipTracker`].
///
/// A member may be reported as added more than once, for example after a
/// resume. Implementations must tolerate duplicates.
pub trait MembershipListener: Send + Sync {
    fn on_entity_added(&self, _unit: &UnitRef) {}

    fn on_entity_removed(&self, _unit: &UnitRef) {}

    fn on_entity_changed(&self, _unit: &UnitRef, _event: &SensorEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Active,
    Suspended,
}

struct TrackerInner {
    group: Arc<Group>,
    bus: Arc<SensorBus>,
    listener: Arc<dyn MembershipListener>,
    sensors: Vec<String>,
    state: Mutex<TrackerState>,
    member_subs: Mutex<HashMap<UnitId, Vec<SubscriptionId>>>,
    group_sub: Mutex<Option<SubscriptionId>>,
}

impl TrackerInner {
    fn is_active(&self) -> bool {
        *self.state.lock() == TrackerState::Active
    }

    /// Subscribe to a member's sensors. Returns false if already attached.
    fn attach(self: &Arc<Self>, unit: &UnitRef) -> bool {
        let id = unit.id();
        let mut subs = self.member_subs.lock();
        if subs.contains_key(&id) {
            return false;
        }

        let ids = self
            .sensors
            .iter()
            .map(|sensor| {
                let weak: Weak<TrackerInner> = Arc::downgrade(self);
                let unit = Arc::clone(unit);
                self.bus.subscribe(id, sensor, move |event| {
                    if let Some(inner) = weak.upgrade() {
                        if inner.is_active() {
                            inner.listener.on_entity_changed(&unit, event);
                        }
                    }
                })
            })
            .collect();
        subs.insert(id, ids);
        true
    }

    fn detach(&self, id: UnitId) -> bool {
        let removed = self.member_subs.lock().remove(&id);
        match removed {
            Some(ids) => {
                for sub in ids {
                    self.bus.unsubscribe(sub);
                }
                true
            }
            None => false,
        }
    }

    fn on_group_change(self: &Arc<Self>, change: &GroupChange) {
        match change {
            GroupChange::MemberAdded(unit) => {
                if self.attach(unit) && self.is_active() {
                    self.listener.on_entity_added(unit);
                }
            }
            GroupChange::MemberRemoved(unit) => {
                if self.detach(unit.id()) && self.is_active() {
                    self.listener.on_entity_removed(unit);
                }
            }
        }
    }
}

/// Follows a group's membership and the tracked sensors of its members.
///
/// Starts [`TrackerState::Active`]. While suspended no callbacks fire, but
/// subscriptions keep following membership; resuming replays
/// `on_entity_added` for every current member.
pub struct MembershipTracker {
    inner: Arc<TrackerInner>,
}

impl MembershipTracker {
    pub fn builder(
        group: Arc<Group>,
        bus: Arc<SensorBus>,
        listener: Arc<dyn MembershipListener>,
    ) -> MembershipTrackerBuilder {
        MembershipTrackerBuilder {
            group,
            bus,
            listener,
            sensors: vec![sensors::SERVICE_UP.to_string()],
        }
    }

    pub fn state(&self) -> TrackerState {
        *self.inner.state.lock()
    }

    pub fn tracked_sensors(&self) -> &[String] {
        &self.inner.sensors
    }

    pub fn suspend(&self) {
        *self.inner.state.lock() = TrackerState::Suspended;
        debug!(group = %self.inner.group.name(), "Membership tracking suspended");
    }

    /// Resume callbacks and report every current member as added.
    pub fn resume(&self) {
        *self.inner.state.lock() = TrackerState::Active;
        debug!(group = %self.inner.group.name(), "Membership tracking resumed");
        for unit in self.inner.group.members() {
            self.inner.listener.on_entity_added(&unit);
        }
    }

    /// Drop every subscription. The tracker is inert afterwards.
    pub fn stop(&self) {
        if let Some(sub) = self.inner.group_sub.lock().take() {
            self.inner.group.unsubscribe(sub);
        }
        let ids: Vec<UnitId> = self.inner.member_subs.lock().keys().copied().collect();
        for id in ids {
            self.inner.detach(id);
        }
        *self.inner.state.lock() = TrackerState::Suspended;
    }
}

impl Drop for MembershipTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct MembershipTrackerBuilder {
    group: Arc<Group>,
    bus: Arc<SensorBus>,
    listener: Arc<dyn MembershipListener>,
    sensors: Vec<String>,
}

impl MembershipTrackerBuilder {
    /// Track an extra sensor on every member.
    pub fn sensor(mut self, name: &str) -> Self {
        if !self.sensors.iter().any(|s| s == name) {
            self.sensors.push(name.to_string());
        }
        self
    }

    /// Start tracking, reporting every existing member as added.
    pub fn build(self) -> MembershipTracker {
        let inner = Arc::new(TrackerInner {
            group: self.group,
            bus: self.bus,
            listener: self.listener,
            sensors: self.sensors,
            state: Mutex::new(TrackerState::Active),
            member_subs: Mutex::new(HashMap::new()),
            group_sub: Mutex::new(None),
        });

        // Subscribe before the resync so no change is missed in between.
        let weak = Arc::downgrade(&inner);
        let sub = inner.group.subscribe(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.on_group_change(change);
            }
        });
        *inner.group_sub.lock() = Some(sub);

        for unit in inner.group.members() {
            if inner.attach(&unit) {
                inner.listener.on_entity_added(&unit);
            }
        }

        MembershipTracker { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedUnit;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl MembershipListener for Recorder {
        fn on_entity_added(&self, unit: &UnitRef) {
            self.events.lock().push(format!("added:{}", unit.display_name()));
        }

        fn on_entity_removed(&self, unit: &UnitRef) {
            self.events.lock().push(format!("removed:{}", unit.display_name()));
        }

        fn on_entity_changed(&self, unit: &UnitRef, event: &SensorEvent) {
            self.events
                .lock()
                .push(format!("changed:{}:{}", unit.display_name(), event.sensor));
        }
    }

    fn setup() -> (Arc<SensorBus>, Arc<Group>, Arc<Recorder>) {
        let bus = Arc::new(SensorBus::new());
        let group = Group::new("web", Arc::clone(&bus));
        (bus, group, Arc::new(Recorder::default()))
    }

    #[test]
    fn resyncs_existing_members_on_build() {
        let (bus, group, recorder) = setup();
        group.add_member(SimulatedUnit::new("a", Arc::clone(&bus)));

        let _tracker = MembershipTracker::builder(Arc::clone(&group), bus, recorder.clone()).build();
        assert_eq!(recorder.take(), vec!["added:a"]);
    }

    #[test]
    fn reports_membership_and_sensor_changes() {
        let (bus, group, recorder) = setup();
        let _tracker =
            MembershipTracker::builder(Arc::clone(&group), Arc::clone(&bus), recorder.clone()).build();

        let a: UnitRef = SimulatedUnit::new("a", Arc::clone(&bus));
        group.add_member(Arc::clone(&a));
        bus.publish(a.id(), sensors::SERVICE_UP, serde_json::json!(true));
        bus.publish(a.id(), sensors::GROUP_SIZE, serde_json::json!(3));
        group.remove_member(a.id());
        bus.publish(a.id(), sensors::SERVICE_UP, serde_json::json!(false));

        assert_eq!(
            recorder.take(),
            vec!["added:a", "changed:a:service.up", "removed:a"]
        );
    }

    #[test]
    fn extra_sensors_are_tracked() {
        let (bus, group, recorder) = setup();
        let _tracker = MembershipTracker::builder(Arc::clone(&group), Arc::clone(&bus), recorder.clone())
            .sensor(sensors::SERVICE_STATE)
            .build();

        let a: UnitRef = SimulatedUnit::new("a", Arc::clone(&bus));
        group.add_member(Arc::clone(&a));
        recorder.take();

        bus.publish(a.id(), sensors::SERVICE_STATE, serde_json::json!("running"));
        assert_eq!(recorder.take(), vec!["changed:a:service.state"]);
    }

    #[test]
    fn suspend_silences_and_resume_replays() {
        let (bus, group, recorder) = setup();
        let tracker =
            MembershipTracker::builder(Arc::clone(&group), Arc::clone(&bus), recorder.clone()).build();

        tracker.suspend();
        let a: UnitRef = SimulatedUnit::new("a", Arc::clone(&bus));
        group.add_member(Arc::clone(&a));
        bus.publish(a.id(), sensors::SERVICE_UP, serde_json::json!(true));
        assert!(recorder.take().is_empty());

        tracker.resume();
        assert_eq!(recorder.take(), vec!["added:a"]);
        assert_eq!(tracker.state(), TrackerState::Active);

        // Subscriptions followed membership while suspended.
        bus.publish(a.id(), sensors::SERVICE_UP, serde_json::json!(false));
        assert_eq!(recorder.take(), vec!["changed:a:service.up"]);
    }

    #[test]
    fn stop_drops_all_subscriptions() {
        let (bus, group, recorder) = setup();
        group.add_member(SimulatedUnit::new("a", Arc::clone(&bus)));
        let tracker =
            MembershipTracker::builder(Arc::clone(&group), Arc::clone(&bus), recorder.clone()).build();
        assert_eq!(bus.subscription_count(), 1);

        tracker.stop();
        assert_eq!(bus.subscription_count(), 0);
        group.add_member(SimulatedUnit::new("b", Arc::clone(&bus)));
        assert_eq!(recorder.take(), vec!["added:a"]);
    }
}
