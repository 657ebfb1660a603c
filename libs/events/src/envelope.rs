//! Sensor event envelope.

use chrono::{DateTime, Utc};
use flotilla_id::UnitId;
use serde::{Deserialize, Serialize};

/// One published sensor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    /// Unit the sensor belongs to.
    pub unit_id: UnitId,

    /// Sensor name, e.g. `service.up`.
    pub sensor: String,

    /// New value.
    pub value: serde_json::Value,

    /// Value before this publish, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<serde_json::Value>,

    pub occurred_at: DateTime<Utc>,
}

impl SensorEvent {
    pub fn new(
        unit_id: UnitId,
        sensor: impl Into<String>,
        value: serde_json::Value,
        previous: Option<serde_json::Value>,
    ) -> Self {
        Self {
            unit_id,
            sensor: sensor.into(),
            value,
            previous,
            occurred_at: Utc::now(),
        }
    }

    /// True when the value differs from what was stored before.
    pub fn is_change(&self) -> bool {
        self.previous.as_ref() != Some(&self.value)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.value.as_u64()
    }
}
