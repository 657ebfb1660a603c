//! Error types for sensor values.

use thiserror::Error;

/// Errors raised when reading typed sensor values.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The sensor has never been published for this unit.
    #[error("sensor '{sensor}' has no value for {unit}")]
    NoValue { unit: String, sensor: String },

    /// The stored value does not decode as the requested type.
    #[error("sensor '{sensor}' value has unexpected shape: {message}")]
    InvalidValue { sensor: String, message: String },
}
