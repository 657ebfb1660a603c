//! # flotilla-events
//!
//! Sensor definitions and the in-process sensor bus.
//!
//! ## Model
//!
//! - A **sensor** is a named signal attached to a unit (`service.up`,
//!   `group.size`, ...). Its value is an arbitrary JSON value.
//! - Publishing a value stores it as the sensor's current value and fans a
//!   [`SensorEvent`] out to every matching subscription.
//! - Subscriptions are either scoped to one unit or bus-wide for a sensor
//!   name. Callbacks run on the publishing thread, after the bus has
//!   released its locks, so a callback may publish or subscribe again.
//!
//! The bus is an explicit value handed to each orchestrator; there is no
//! process-global instance.

mod bus;
mod envelope;
mod error;
mod types;

pub use bus::{SensorBus, SensorCallback};
pub use envelope::SensorEvent;
pub use error::EventError;
pub use types::*;
