//! Holding area for units that failed to start.

use std::sync::Arc;

use flotilla_events::sensors;
use flotilla_id::UnitId;
use tracing::{info, warn};

use super::Group;
use crate::context::Services;
use crate::error::{AggregateError, OrchestratorError, OrchestratorResult, UnitFailure};
use crate::unit::{MemberSet, UnitRef};

/// Group of failed units kept around for inspection instead of being
/// discarded. Quarantined units never count towards a cluster's size.
pub struct QuarantineGroup {
    group: Arc<Group>,
    services: Services,
}

impl QuarantineGroup {
    pub fn new(name: impl Into<String>, services: Services) -> Self {
        let group = Group::new(name, Arc::clone(&services.bus));
        group.watch_lifecycle();
        Self { group, services }
    }

    pub fn id(&self) -> UnitId {
        self.group.id()
    }

    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    pub fn quarantine(&self, unit: UnitRef) {
        let id = unit.id();
        if self.group.add_member(unit) {
            warn!(quarantine = %self.group.name(), unit_id = %id, "Unit quarantined");
            self.publish_size();
        }
    }

    pub fn members(&self) -> Vec<UnitRef> {
        self.group.members()
    }

    pub fn contains(&self, id: UnitId) -> bool {
        self.group.has_member(id)
    }

    pub fn len(&self) -> usize {
        self.group.current_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard every quarantined unit, optionally stopping each first.
    ///
    /// Units are unmanaged even when their stop fails; stop failures are
    /// returned together once everything has been expunged.
    pub async fn expunge_members(&self, stop_first: bool) -> OrchestratorResult<usize> {
        let members = self.group.members();
        let count = members.len();
        if count == 0 {
            return Ok(0);
        }

        info!(quarantine = %self.group.name(), count, stop_first, "Expunging quarantined units");

        let failures: Vec<UnitFailure> = if stop_first {
            let tasks: Vec<_> = members
                .iter()
                .map(|unit| {
                    let unit = Arc::clone(unit);
                    async move {
                        let unit_id = unit.id();
                        unit.stop()
                            .await
                            .map_err(|source| OrchestratorError::StopFailed { unit_id, source })
                    }
                })
                .collect();

            self.services
                .tasks
                .run_parallel("quarantine.expunge", tasks)
                .await
                .into_iter()
                .zip(&members)
                .filter_map(|(result, unit)| {
                    result
                        .err()
                        .map(|e| UnitFailure::new(Some(unit.id()), None, e.into()))
                })
                .collect()
        } else {
            Vec::new()
        };

        for unit in &members {
            self.group.remove_member(unit.id());
            self.services.registry.unmanage(unit.id());
        }
        self.publish_size();

        match AggregateError::from_failures(failures) {
            Some(agg) => Err(agg.into()),
            None => Ok(count),
        }
    }

    fn publish_size(&self) {
        self.services.bus.publish(
            self.group.id(),
            sensors::QUARANTINE_SIZE,
            serde_json::json!(self.group.current_size()),
        );
    }
}

impl std::fmt::Debug for QuarantineGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuarantineGroup")
            .field("group", &self.group)
            .finish()
    }
}
