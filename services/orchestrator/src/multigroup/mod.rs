//! Rebucketing group.
//!
//! A [`MultiGroup`] partitions the units of a source collection into
//! bucket groups keyed by a bucket function. Buckets appear when a key is
//! first seen and disappear once empty.

mod worker;

pub use worker::RescanWorker;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use flotilla_events::SensorBus;
use flotilla_id::{SubscriptionId, UnitId};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::context::Services;
use crate::group::Group;
use crate::unit::{MemberSet, UnitRef};

/// Selects which source units take part in bucketing.
pub type EntityFilter = Arc<dyn Fn(&UnitRef) -> bool + Send + Sync>;

/// Bucket key of a unit. `None` keeps the unit out of every bucket.
pub type BucketFn = Arc<dyn Fn(&UnitRef) -> Option<String> + Send + Sync>;

/// Bucket by the current string value of a sensor.
pub fn bucket_by_sensor(bus: Arc<SensorBus>, sensor: &str) -> BucketFn {
    let sensor = sensor.to_string();
    Arc::new(move |unit: &UnitRef| {
        bus.current(unit.id(), &sensor).and_then(|value| match value {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        })
    })
}

/// What one rescan changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescanStats {
    pub units_bucketed: usize,
    pub buckets_created: usize,
    pub buckets_destroyed: usize,
    pub moves: usize,
}

/// Partitions a source collection into bucket groups.
pub struct MultiGroup {
    name: String,
    services: Services,
    source: Arc<dyn MemberSet>,
    filter: EntityFilter,
    bucket_fn: BucketFn,
    buckets: Mutex<BTreeMap<String, Arc<Group>>>,

    /// Serializes rescans. Must not be re-entered from a bucket listener.
    rescan_lock: Mutex<()>,
    sensor_subs: Mutex<Vec<SubscriptionId>>,
}

impl MultiGroup {
    pub fn new(
        name: impl Into<String>,
        services: Services,
        source: Arc<dyn MemberSet>,
        bucket_fn: BucketFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            services,
            source,
            filter: Arc::new(|_: &UnitRef| true),
            bucket_fn,
            buckets: Mutex::new(BTreeMap::new()),
            rescan_lock: Mutex::new(()),
            sensor_subs: Mutex::new(Vec::new()),
        })
    }

    /// Same as [`MultiGroup::new`], bucketing only units `filter` accepts.
    pub fn with_filter(
        name: impl Into<String>,
        services: Services,
        source: Arc<dyn MemberSet>,
        filter: EntityFilter,
        bucket_fn: BucketFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            services,
            source,
            filter,
            bucket_fn,
            buckets: Mutex::new(BTreeMap::new()),
            rescan_lock: Mutex::new(()),
            sensor_subs: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buckets(&self) -> BTreeMap<String, Arc<Group>> {
        self.buckets.lock().clone()
    }

    pub fn bucket(&self, key: &str) -> Option<Arc<Group>> {
        self.buckets.lock().get(key).cloned()
    }

    pub fn bucket_keys(&self) -> Vec<String> {
        self.buckets.lock().keys().cloned().collect()
    }

    /// Recompute bucket membership from the source.
    pub fn rescan(&self) -> RescanStats {
        let _serial = self.rescan_lock.lock();
        let mut stats = RescanStats::default();

        let mut desired: BTreeMap<String, Vec<UnitRef>> = BTreeMap::new();
        for unit in self.source.members() {
            if !(self.filter)(&unit) {
                continue;
            }
            if let Some(key) = (self.bucket_fn)(&unit) {
                desired.entry(key).or_default().push(unit);
                stats.units_bucketed += 1;
            }
        }

        let buckets: BTreeMap<String, Arc<Group>> = {
            let mut buckets = self.buckets.lock();
            for key in desired.keys() {
                if !buckets.contains_key(key) {
                    let group = Group::new(format!("{}:{}", self.name, key), Arc::clone(&self.services.bus));
                    group.watch_lifecycle();
                    buckets.insert(key.clone(), group);
                    stats.buckets_created += 1;
                    debug!(multigroup = %self.name, bucket = %key, "Bucket created");
                }
            }
            buckets.clone()
        };

        for (key, group) in &buckets {
            let wanted: HashSet<UnitId> = desired
                .get(key)
                .map(|units| units.iter().map(|u| u.id()).collect())
                .unwrap_or_default();
            for id in group.member_ids() {
                if !wanted.contains(&id) {
                    group.remove_member(id);
                    stats.moves += 1;
                }
            }
        }
        for (key, units) in desired {
            if let Some(group) = buckets.get(&key) {
                for unit in units {
                    group.add_member(unit);
                }
            }
        }

        let emptied: Vec<Arc<Group>> = {
            let mut buckets = self.buckets.lock();
            let keys: Vec<String> = buckets
                .iter()
                .filter(|(_, g)| g.current_size() == 0)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| buckets.remove(k)).collect()
        };
        for group in emptied {
            debug!(multigroup = %self.name, bucket = %group.name(), "Bucket destroyed");
            group.destroy();
            stats.buckets_destroyed += 1;
        }

        if stats.buckets_created > 0 || stats.buckets_destroyed > 0 || stats.moves > 0 {
            info!(
                multigroup = %self.name,
                units = stats.units_bucketed,
                created = stats.buckets_created,
                destroyed = stats.buckets_destroyed,
                moves = stats.moves,
                "Rescan changed buckets"
            );
        }
        stats
    }

    /// Rescan whenever `sensor` changes on any unit.
    pub fn rescan_on_sensor(self: &Arc<Self>, sensor: &str) {
        let weak = Arc::downgrade(self);
        let sub = self.services.bus.subscribe_all(sensor, move |event| {
            if !event.is_change() {
                return;
            }
            if let Some(multigroup) = weak.upgrade() {
                multigroup.rescan();
            }
        });
        self.sensor_subs.lock().push(sub);
    }
}

impl Drop for MultiGroup {
    fn drop(&mut self) {
        for sub in self.sensor_subs.get_mut().drain(..) {
            self.services.bus.unsubscribe(sub);
        }
    }
}

impl std::fmt::Debug for MultiGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiGroup")
            .field("name", &self.name)
            .field("buckets", &self.bucket_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedUnit;
    use flotilla_events::sensors;

    fn setup() -> (Services, Arc<Group>) {
        let services = Services::new();
        let source = Group::new("source", Arc::clone(&services.bus));
        (services, source)
    }

    fn tagged(services: &Services, source: &Group, name: &str, tag: Option<&str>) -> UnitRef {
        let unit: UnitRef = SimulatedUnit::new(name, Arc::clone(&services.bus));
        if let Some(tag) = tag {
            services
                .bus
                .publish(unit.id(), sensors::BUCKET, serde_json::json!(tag));
        }
        source.add_member(Arc::clone(&unit));
        unit
    }

    #[test]
    fn units_land_in_their_bucket() {
        let (services, source) = setup();
        let a = tagged(&services, &source, "a", Some("red"));
        let b = tagged(&services, &source, "b", Some("blue"));
        tagged(&services, &source, "c", None);

        let mg = MultiGroup::new(
            "colors",
            services.clone(),
            source.clone(),
            bucket_by_sensor(Arc::clone(&services.bus), sensors::BUCKET),
        );
        let stats = mg.rescan();

        assert_eq!(stats.buckets_created, 2);
        assert_eq!(stats.units_bucketed, 2);
        assert_eq!(mg.bucket_keys(), vec!["blue", "red"]);
        assert!(mg.bucket("red").unwrap().has_member(a.id()));
        assert!(mg.bucket("blue").unwrap().has_member(b.id()));
    }

    #[test]
    fn moving_a_unit_empties_and_destroys_its_old_bucket() {
        let (services, source) = setup();
        let a = tagged(&services, &source, "a", Some("red"));

        let mg = MultiGroup::new(
            "colors",
            services.clone(),
            source.clone(),
            bucket_by_sensor(Arc::clone(&services.bus), sensors::BUCKET),
        );
        mg.rescan();
        let red = mg.bucket("red").unwrap();

        services
            .bus
            .publish(a.id(), sensors::BUCKET, serde_json::json!("blue"));
        let stats = mg.rescan();

        assert_eq!(stats.buckets_destroyed, 1);
        assert!(red.is_destroyed());
        assert_eq!(mg.bucket_keys(), vec!["blue"]);
        assert!(mg.bucket("blue").unwrap().has_member(a.id()));
    }

    #[test]
    fn filter_excludes_units() {
        let (services, source) = setup();
        tagged(&services, &source, "a", Some("red"));
        let b = tagged(&services, &source, "b", Some("red"));

        let keep = b.id();
        let mg = MultiGroup::with_filter(
            "colors",
            services.clone(),
            source.clone(),
            Arc::new(move |u: &UnitRef| u.id() == keep),
            bucket_by_sensor(Arc::clone(&services.bus), sensors::BUCKET),
        );
        mg.rescan();

        assert_eq!(mg.bucket("red").unwrap().member_ids(), vec![keep]);
    }

    #[test]
    fn sensor_changes_trigger_rescan() {
        let (services, source) = setup();
        let a = tagged(&services, &source, "a", Some("red"));

        let mg = MultiGroup::new(
            "colors",
            services.clone(),
            source.clone(),
            bucket_by_sensor(Arc::clone(&services.bus), sensors::BUCKET),
        );
        mg.rescan_on_sensor(sensors::BUCKET);
        mg.rescan();

        services
            .bus
            .publish(a.id(), sensors::BUCKET, serde_json::json!("green"));
        assert_eq!(mg.bucket_keys(), vec!["green"]);
    }
}
