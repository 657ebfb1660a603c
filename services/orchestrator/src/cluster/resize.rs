//! Growing, shrinking and replacing cluster members.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use flotilla_events::{sensors, ConvergenceState};
use flotilla_id::UnitId;
use flotilla_reconcile::select_for_removal;
use tracing::{debug, info, instrument, warn};

use super::{Cluster, Lifecycle};
use crate::error::{OrchestratorError, OrchestratorResult, UnitFailure};
use crate::location::LocationRef;
use crate::unit::{MemberSet, PlacementContext, UnitRef};

impl Cluster {
    /// Drive membership to `desired` members and return the achieved size.
    ///
    /// Concurrent calls are serialized. Any member that fails to start or
    /// stop makes the call return [`OrchestratorError::Capacity`] once
    /// every other member has been accounted for.
    #[instrument(skip(self), fields(cluster_id = %self.id, cluster = %self.name))]
    pub async fn resize(&self, desired: usize) -> OrchestratorResult<usize> {
        let _guard = self.resize_lock.lock().await;
        {
            let state = self.state.lock();
            if matches!(state.lifecycle, Lifecycle::Stopping | Lifecycle::Stopped) {
                return Err(OrchestratorError::Configuration(format!(
                    "cluster {} is stopped",
                    self.name
                )));
            }
            if state.location.is_none() {
                return Err(OrchestratorError::Configuration(format!(
                    "cluster {} has not been started",
                    self.name
                )));
            }
        }
        self.resize_locked(desired).await
    }

    /// Resize while holding the resize lock.
    pub(super) async fn resize_locked(&self, desired: usize) -> OrchestratorResult<usize> {
        self.state.lock().target_size = desired;
        let current = self.group.current_size();

        let outcome = match desired.cmp(&current) {
            Ordering::Equal => Ok(current),
            Ordering::Greater => {
                self.publish_converging();
                self.grow(desired, desired - current).await
            }
            Ordering::Less => {
                self.publish_converging();
                self.shrink(desired, current - desired).await
            }
        };

        self.publish_health();
        outcome
    }

    async fn grow(&self, desired: usize, delta: usize) -> OrchestratorResult<usize> {
        let locations = self.plan_locations(delta)?;
        info!(delta, desired, "Growing cluster");

        let this = self.arc()?;
        let tasks: Vec<_> = locations
            .into_iter()
            .map(|location| {
                let cluster = Arc::clone(&this);
                let index = self.next_index();
                async move { Ok(cluster.create_member(location, index).await) }
            })
            .collect();

        let failures = collect_failures(self.services.tasks.run_parallel("cluster.grow", tasks).await);
        let achieved = self.group.current_size();

        if failures.is_empty() {
            info!(achieved, "Cluster grown");
            Ok(achieved)
        } else {
            warn!(achieved, desired, failures = failures.len(), "Cluster growth incomplete");
            Err(OrchestratorError::Capacity {
                requested: desired,
                achieved,
                causes: failures,
            })
        }
    }

    async fn shrink(&self, desired: usize, delta: usize) -> OrchestratorResult<usize> {
        let strategy = self.removal_strategy.read().clone();
        let chosen: Vec<UnitRef> = select_for_removal(self.group.members(), delta, |c| strategy(c));
        info!(delta, desired, chosen = chosen.len(), "Shrinking cluster");

        let this = self.arc()?;
        let tasks: Vec<_> = chosen
            .iter()
            .map(|unit| {
                let cluster = Arc::clone(&this);
                let unit = Arc::clone(unit);
                async move { Ok(cluster.stop_member(unit).await) }
            })
            .collect();

        let mut failures = collect_failures(self.services.tasks.run_parallel("cluster.shrink", tasks).await);
        if chosen.len() < delta {
            failures.push(UnitFailure::new(
                None,
                None,
                anyhow!(
                    "removal strategy selected {} of {} members",
                    chosen.len(),
                    delta
                ),
            ));
        }
        self.refresh_first_member();

        let achieved = self.group.current_size();
        if failures.is_empty() {
            info!(achieved, "Cluster shrunk");
            Ok(achieved)
        } else {
            warn!(achieved, desired, failures = failures.len(), "Cluster shrink incomplete");
            Err(OrchestratorError::Capacity {
                requested: desired,
                achieved,
                causes: failures,
            })
        }
    }

    /// Replace a member with a new one in the same zone.
    ///
    /// The replacement is started before the original is stopped. If it
    /// cannot be created the original is left in place.
    #[instrument(skip(self), fields(cluster_id = %self.id, cluster = %self.name))]
    pub async fn replace_member(&self, member_id: &str) -> OrchestratorResult<UnitId> {
        let unit = self
            .services
            .registry
            .resolve(member_id)
            .ok_or_else(|| OrchestratorError::unresolvable(member_id))?;
        let unit_id = unit.id();

        let _guard = self.resize_lock.lock().await;
        if !self.group.has_member(unit_id) {
            return Err(OrchestratorError::not_a_member(unit_id, &self.name));
        }

        let location = self
            .placement_of(unit_id)
            .or_else(|| self.location())
            .ok_or_else(|| {
                OrchestratorError::Configuration(format!("cluster {} has not been started", self.name))
            })?;
        info!(unit_id = %unit_id, location = %location, "Replacing member");

        let current = self.group.current_size();
        let this = self.arc()?;
        let index = self.next_index();
        let task = async move { Ok(this.create_member(location, index).await) };
        let created = self
            .services
            .tasks
            .run_parallel("cluster.replace", vec![task])
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(OrchestratorError::Task("replacement task vanished".to_string())));

        let replacement = match created {
            Ok(Ok(unit)) => unit,
            Ok(Err(failure)) => {
                return Err(OrchestratorError::ReplaceFailed {
                    unit_id,
                    source: Box::new(OrchestratorError::Capacity {
                        requested: current + 1,
                        achieved: current,
                        causes: vec![failure],
                    }),
                })
            }
            Err(e) => {
                return Err(OrchestratorError::ReplaceFailed {
                    unit_id,
                    source: Box::new(e),
                })
            }
        };

        let stopped = unit.stop().await;
        self.group.remove_member(unit_id);
        self.placements.lock().remove(&unit_id);
        self.refresh_first_member();
        self.publish_health();

        match stopped {
            Ok(()) => {
                self.services.registry.unmanage(unit_id);
                info!(unit_id = %unit_id, replacement = %replacement.id(), "Member replaced");
                Ok(replacement.id())
            }
            Err(source) => {
                warn!(unit_id = %unit_id, error = %format!("{:#}", source), "Replaced member failed to stop");
                Err(OrchestratorError::StopFailed { unit_id, source })
            }
        }
    }

    /// Create and start one member, folding the outcome into membership.
    async fn create_member(&self, location: LocationRef, index: u64) -> Result<UnitRef, UnitFailure> {
        let first = index == 0;
        let factory = match (&self.first_member_factory, first) {
            (Some(factory), true) => Arc::clone(factory),
            _ => Arc::clone(&self.factory),
        };
        let overrides = match (&self.first_member_overrides, first) {
            (Some(overrides), true) => overrides.clone(),
            _ => self.member_overrides.clone(),
        };
        let ctx = PlacementContext {
            owner: self.id,
            location: location.clone(),
            member_index: index,
            overrides,
        };
        let zone = Some(location.name.clone());

        let unit = match factory.create(&ctx).await {
            Ok(unit) => unit,
            Err(cause) => {
                warn!(location = %location, member_index = index, error = %format!("{:#}", cause), "Factory failed");
                self.record_outcome(&location, false);
                return Err(UnitFailure::new(None, zone, cause));
            }
        };
        let unit_id = unit.id();
        self.services.registry.manage(Arc::clone(&unit));
        self.group.add_child(Arc::clone(&unit));

        if !unit.is_startable() {
            warn!(unit_id = %unit_id, "Factory produced a unit that cannot be started");
            self.discard(unit_id);
            return Err(UnitFailure::new(
                Some(unit_id),
                zone,
                anyhow!("unit {} is not startable", unit_id),
            ));
        }

        if let Err(cause) = unit.start(std::slice::from_ref(&location)).await {
            self.record_outcome(&location, false);
            warn!(unit_id = %unit_id, location = %location, error = %format!("{:#}", cause), "Member failed to start");
            if self.quarantine_enabled && (self.quarantine_filter)(&cause) {
                self.quarantine_or_init().quarantine(Arc::clone(&unit));
            } else {
                self.discard(unit_id);
            }
            return Err(UnitFailure::new(Some(unit_id), zone, cause));
        }
        self.record_outcome(&location, true);

        // The caller may have given up and the cluster been stopped meanwhile.
        if self.is_stopping() {
            if let Err(e) = unit.stop().await {
                warn!(unit_id = %unit_id, error = %format!("{:#}", e), "Late member failed to stop");
            }
            self.discard(unit_id);
            return Err(UnitFailure::new(
                Some(unit_id),
                zone,
                anyhow!("cluster {} stopped while member was starting", self.name),
            ));
        }

        self.placements.lock().insert(unit_id, location);
        self.group.add_member(Arc::clone(&unit));
        self.refresh_first_member();
        debug!(unit_id = %unit_id, member_index = index, "Member started");
        Ok(unit)
    }

    /// Stop a member and discard it whatever the stop outcome.
    async fn stop_member(&self, unit: UnitRef) -> Result<(), UnitFailure> {
        let unit_id = unit.id();
        let zone = self.placement_of(unit_id).map(|loc| loc.name);

        let stopped = unit.stop().await;
        self.group.remove_member(unit_id);
        self.placements.lock().remove(&unit_id);
        self.services.registry.unmanage(unit_id);

        stopped.map_err(|source| {
            warn!(unit_id = %unit_id, error = %format!("{:#}", source), "Member failed to stop");
            UnitFailure::new(
                Some(unit_id),
                zone,
                OrchestratorError::StopFailed { unit_id, source }.into(),
            )
        })
    }

    fn discard(&self, unit_id: UnitId) {
        self.group.remove_child(unit_id);
        self.services.registry.unmanage(unit_id);
    }

    fn is_stopping(&self) -> bool {
        matches!(
            self.state.lock().lifecycle,
            Lifecycle::Stopping | Lifecycle::Stopped
        )
    }

    /// Keep `cluster.first` pointing at the oldest member.
    fn refresh_first_member(&self) {
        let members = self.group.members();
        let next = {
            let mut first = self.first_member.lock();
            if first.is_some_and(|id| members.iter().any(|m| m.id() == id)) {
                return;
            }
            let next = members.first().map(|m| m.id());
            if *first == next {
                return;
            }
            *first = next;
            next
        };

        self.services.bus.publish(
            self.id,
            sensors::CLUSTER_FIRST,
            serde_json::json!(next.map(|id| id.to_string())),
        );
    }

    fn publish_converging(&self) {
        self.services.bus.publish(
            self.id,
            sensors::CLUSTER_CONVERGENCE,
            serde_json::json!(ConvergenceState::Converging),
        );
    }
}

/// Per-unit failures out of a batch of creation or stop tasks.
fn collect_failures<T>(results: Vec<OrchestratorResult<Result<T, UnitFailure>>>) -> Vec<UnitFailure> {
    results
        .into_iter()
        .filter_map(|result| match result {
            Ok(Ok(_)) => None,
            Ok(Err(failure)) => Some(failure),
            Err(e) => Some(UnitFailure::new(None, None, e.into())),
        })
        .collect()
}
