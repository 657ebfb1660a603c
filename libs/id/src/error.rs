//! Identifier parse errors.

use thiserror::Error;

/// Errors returned when a string does not parse as a typed identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    /// No `_` between prefix and ULID.
    #[error("identifier has no '_' separator")]
    MissingSeparator,

    #[error("identifier prefix mismatch: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("identifier body is not a ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// True when the identifier belonged to a different resource kind.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
