//! Registry of managed units.

use std::collections::HashMap;
use std::sync::Arc;

use flotilla_events::{sensors, SensorBus};
use flotilla_id::UnitId;
use parking_lot::RwLock;
use tracing::debug;

use crate::unit::UnitRef;

/// Tracks which units are under management and announces when one leaves.
///
/// Unmanaging publishes [`sensors::UNMANAGED`] for the unit, which groups
/// watching their lifecycle use to drop it from membership.
pub struct UnitRegistry {
    units: RwLock<HashMap<UnitId, UnitRef>>,
    bus: Arc<SensorBus>,
}

impl UnitRegistry {
    pub fn new(bus: Arc<SensorBus>) -> Self {
        Self {
            units: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Start managing a unit. Managing twice is a no-op.
    pub fn manage(&self, unit: UnitRef) {
        let id = unit.id();
        if self.units.write().insert(id, unit).is_none() {
            debug!(unit_id = %id, "Managing unit");
        }
    }

    /// Stop managing a unit. Returns the unit if it was managed.
    pub fn unmanage(&self, id: UnitId) -> Option<UnitRef> {
        let removed = self.units.write().remove(&id);
        if removed.is_some() {
            debug!(unit_id = %id, "Unmanaging unit");
            self.bus
                .publish(id, sensors::UNMANAGED, serde_json::Value::Bool(true));
            self.bus.forget(id);
        }
        removed
    }

    pub fn get(&self, id: UnitId) -> Option<UnitRef> {
        self.units.read().get(&id).cloned()
    }

    /// Look up a unit by its string id. Malformed ids resolve to nothing.
    pub fn resolve(&self, id: &str) -> Option<UnitRef> {
        id.parse::<UnitId>().ok().and_then(|id| self.get(id))
    }

    pub fn is_managed(&self, id: UnitId) -> bool {
        self.units.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("units", &self.units.read().len())
            .finish()
    }
}
