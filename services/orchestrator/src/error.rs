//! Error taxonomy for orchestration operations.
//!
//! Per-unit failures are caught where they happen and carried as
//! [`UnitFailure`]s; group-level operations fold them into a single
//! [`OrchestratorError`].

use std::fmt;

use flotilla_id::UnitId;
use thiserror::Error;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by clusters, fabrics and groups.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Fewer members than requested after a resize, start or stop.
    #[error(
        "insufficient capacity: achieved {achieved} of {requested} requested members{}",
        summarize(.causes)
    )]
    Capacity {
        requested: usize,
        achieved: usize,
        causes: Vec<UnitFailure>,
    },

    /// A referenced unit does not exist or is not a member.
    #[error("{0}")]
    NotFound(String),

    /// A member could not be stopped.
    #[error("failed to stop {unit_id}: {source:#}")]
    StopFailed {
        unit_id: UnitId,
        #[source]
        source: anyhow::Error,
    },

    /// A replacement could not be created; the original member is untouched.
    #[error("failed to grow while replacing {unit_id}: {source}")]
    ReplaceFailed {
        unit_id: UnitId,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// A spawned task panicked or timed out.
    #[error("task error: {0}")]
    Task(String),
}

impl OrchestratorError {
    pub(crate) fn unresolvable(id: &str) -> Self {
        OrchestratorError::NotFound(format!("unit {} cannot be resolved", id))
    }

    pub(crate) fn not_a_member(id: UnitId, group: &str) -> Self {
        OrchestratorError::NotFound(format!("unit {} is not a member of {}", id, group))
    }

    /// Achieved size carried by a capacity error.
    pub fn achieved(&self) -> Option<usize> {
        match self {
            OrchestratorError::Capacity { achieved, .. } => Some(*achieved),
            _ => None,
        }
    }

    /// Per-unit causes carried by capacity and aggregate errors.
    pub fn causes(&self) -> &[UnitFailure] {
        match self {
            OrchestratorError::Capacity { causes, .. } => causes,
            OrchestratorError::Aggregate(agg) => agg.failures(),
            _ => &[],
        }
    }
}

fn summarize(causes: &[UnitFailure]) -> String {
    match causes {
        [] => String::new(),
        [only] => format!(": {}", only),
        [first, rest @ ..] => format!(": {} (and {} more)", first, rest.len()),
    }
}

// =============================================================================
// Per-unit failures
// =============================================================================

/// Failure of one unit during a group operation.
#[derive(Debug)]
pub struct UnitFailure {
    /// `None` when the factory failed before a unit existed.
    pub unit_id: Option<UnitId>,

    /// Zone the unit was placed in, if any.
    pub zone: Option<String>,

    pub cause: anyhow::Error,
}

impl UnitFailure {
    pub fn new(unit_id: Option<UnitId>, zone: Option<String>, cause: anyhow::Error) -> Self {
        Self {
            unit_id,
            zone,
            cause,
        }
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit_id {
            Some(id) => write!(f, "{}", id)?,
            None => write!(f, "<uncreated>")?,
        }
        if let Some(zone) = &self.zone {
            write!(f, " in {}", zone)?;
        }
        write!(f, ": {:#}", self.cause)
    }
}

/// Several independent failures, displayed by the first one.
#[derive(Debug)]
pub struct AggregateError {
    failures: Vec<UnitFailure>,
}

impl AggregateError {
    /// `None` when there is nothing to aggregate.
    pub fn from_failures(failures: Vec<UnitFailure>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self { failures })
        }
    }

    pub fn first(&self) -> &UnitFailure {
        &self.failures[0]
    }

    pub fn failures(&self) -> &[UnitFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<UnitFailure> {
        self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.first())?;
        if self.failures.len() > 1 {
            write!(f, " (and {} more failures)", self.failures.len() - 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_message_names_first_cause() {
        let err = OrchestratorError::Capacity {
            requested: 3,
            achieved: 2,
            causes: vec![UnitFailure::new(
                None,
                Some("zone-a".into()),
                anyhow::anyhow!("boom"),
            )],
        };
        let msg = err.to_string();
        assert!(msg.contains("achieved 2 of 3"));
        assert!(msg.contains("<uncreated> in zone-a: boom"));
        assert_eq!(err.achieved(), Some(2));
    }

    #[test]
    fn aggregate_displays_first_and_counts_rest() {
        let agg = AggregateError::from_failures(vec![
            UnitFailure::new(None, None, anyhow::anyhow!("first")),
            UnitFailure::new(None, None, anyhow::anyhow!("second")),
        ])
        .unwrap();
        assert_eq!(agg.to_string(), "<uncreated>: first (and 1 more failures)");
        assert_eq!(agg.len(), 2);
        assert!(AggregateError::from_failures(Vec::new()).is_none());
    }

    #[test]
    fn not_found_messages() {
        let id = UnitId::new();
        assert!(OrchestratorError::unresolvable("unit_x")
            .to_string()
            .contains("cannot be resolved"));
        assert!(OrchestratorError::not_a_member(id, "web")
            .to_string()
            .contains("not a member"));
    }

    #[test]
    fn replace_failed_says_failed_to_grow() {
        let err = OrchestratorError::ReplaceFailed {
            unit_id: UnitId::new(),
            source: Box::new(OrchestratorError::Configuration("x".into())),
        };
        assert!(err.to_string().contains("failed to grow"));
    }
}
