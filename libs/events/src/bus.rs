//! In-process sensor bus.

use std::collections::HashMap;
use std::sync::Arc;

use flotilla_id::{SubscriptionId, UnitId};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::envelope::SensorEvent;
use crate::error::EventError;

/// Callback invoked for every matching [`SensorEvent`].
pub type SensorCallback = Arc<dyn Fn(&SensorEvent) + Send + Sync>;

struct Subscription {
    /// `None` subscribes to the sensor on every unit.
    unit: Option<UnitId>,
    sensor: String,
    callback: SensorCallback,
}

/// Publish/subscribe hub for unit sensors, also storing each sensor's
/// current value.
#[derive(Default)]
pub struct SensorBus {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    values: RwLock<HashMap<(UnitId, String), serde_json::Value>>,
}

impl SensorBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one sensor of one unit.
    pub fn subscribe<F>(&self, unit: UnitId, sensor: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&SensorEvent) + Send + Sync + 'static,
    {
        self.insert(Some(unit), sensor, Arc::new(callback))
    }

    /// Subscribe to a sensor on every unit, current and future.
    pub fn subscribe_all<F>(&self, sensor: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&SensorEvent) + Send + Sync + 'static,
    {
        self.insert(None, sensor, Arc::new(callback))
    }

    fn insert(&self, unit: Option<UnitId>, sensor: &str, callback: SensorCallback) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.subscriptions.write().insert(
            id,
            Subscription {
                unit,
                sensor: sensor.to_string(),
                callback,
            },
        );
        id
    }

    /// Drop a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.write().remove(&id).is_some()
    }

    /// Store a new value and notify subscribers.
    pub fn publish(&self, unit: UnitId, sensor: &str, value: serde_json::Value) {
        let previous = self
            .values
            .write()
            .insert((unit, sensor.to_string()), value.clone());

        let event = SensorEvent::new(unit, sensor, value, previous);

        // Snapshot callbacks so none run under the lock.
        let callbacks: Vec<SensorCallback> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.sensor == sensor && s.unit.is_none_or(|u| u == unit))
            .map(|s| Arc::clone(&s.callback))
            .collect();

        trace!(
            unit_id = %unit,
            sensor,
            listeners = callbacks.len(),
            "Publishing sensor"
        );

        for callback in callbacks {
            callback(&event);
        }
    }

    /// Current value of a sensor, if it was ever published.
    pub fn current(&self, unit: UnitId, sensor: &str) -> Option<serde_json::Value> {
        self.values.read().get(&(unit, sensor.to_string())).cloned()
    }

    /// Current value decoded as `T`.
    pub fn current_as<T: DeserializeOwned>(&self, unit: UnitId, sensor: &str) -> Result<T, EventError> {
        let value = self.current(unit, sensor).ok_or_else(|| EventError::NoValue {
            unit: unit.to_string(),
            sensor: sensor.to_string(),
        })?;

        serde_json::from_value(value).map_err(|e| EventError::InvalidValue {
            sensor: sensor.to_string(),
            message: e.to_string(),
        })
    }

    /// Forget every stored value for a unit. Subscriptions are untouched.
    pub fn forget(&self, unit: UnitId) {
        self.values.write().retain(|(u, _), _| *u != unit);
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl std::fmt::Debug for SensorBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorBus")
            .field("subscriptions", &self.subscriptions.read().len())
            .field("values", &self.values.read().len())
            .finish()
    }
}
