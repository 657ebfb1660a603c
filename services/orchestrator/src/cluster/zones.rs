//! Availability zone binding and member placement.

use std::collections::{HashMap, HashSet};

use flotilla_reconcile::plan_placements;
use tracing::{info, warn};

use super::Cluster;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::location::LocationRef;

impl Cluster {
    /// Resolve and record the zones of `location`, when zones are enabled.
    pub(super) async fn bind_zones(&self, location: &LocationRef) -> OrchestratorResult<()> {
        let (selection, provider) = match (&self.zone_selection, &self.zone_provider) {
            (Some(selection), Some(provider)) => (selection, provider),
            _ => return Ok(()),
        };
        if !self.state.lock().zones.is_empty() {
            return Ok(());
        }

        let available = provider.sub_locations(location).await.map_err(|e| {
            OrchestratorError::Configuration(format!(
                "cannot list availability zones of {}: {:#}",
                location, e
            ))
        })?;
        let zones = selection.apply(available)?;

        info!(
            cluster_id = %self.id,
            zones = ?zones.iter().map(|z| z.name.as_str()).collect::<Vec<_>>(),
            "Bound availability zones"
        );
        self.state.lock().zones = zones;
        Ok(())
    }

    /// Locations for `count` new members.
    ///
    /// Without zones every member goes to the bound location. With zones,
    /// each goes to the least populated zone not currently avoided.
    pub(super) fn plan_locations(&self, count: usize) -> OrchestratorResult<Vec<LocationRef>> {
        let (location, zones) = {
            let state = self.state.lock();
            (state.location.clone(), state.zones.clone())
        };
        let location = location.ok_or_else(|| {
            OrchestratorError::Configuration(format!("cluster {} has not been started", self.name))
        })?;

        if zones.is_empty() {
            return Ok(vec![location; count]);
        }

        let current = self.zone_counts(&zones);
        let avoided: HashSet<LocationRef> = {
            let detector = self.detector.lock();
            zones
                .iter()
                .filter(|z| detector.has_failed(&z.name))
                .cloned()
                .collect()
        };
        if !avoided.is_empty() {
            let names: Vec<&str> = avoided.iter().map(|z| z.name.as_str()).collect();
            if avoided.len() == zones.len() {
                warn!(cluster_id = %self.id, zones = ?names, "Every zone is failing, placing anyway");
            } else {
                info!(cluster_id = %self.id, zones = ?names, "Avoiding failing zones");
            }
        }

        Ok(plan_placements(count, &zones, &current, &avoided))
    }

    /// Members per zone, counting only current members.
    fn zone_counts(&self, zones: &[LocationRef]) -> HashMap<LocationRef, usize> {
        let members = self.group.member_ids();
        let placements = self.placements.lock();
        let mut counts: HashMap<LocationRef, usize> =
            zones.iter().map(|z| (z.clone(), 0)).collect();
        for id in members {
            if let Some(count) = placements.get(&id).and_then(|loc| counts.get_mut(loc)) {
                *count += 1;
            }
        }
        counts
    }

    /// Feed a start outcome at `location` to the zone failure detector.
    pub(super) fn record_outcome(&self, location: &LocationRef, succeeded: bool) {
        if self.zone_selection.is_none() {
            return;
        }
        let mut detector = self.detector.lock();
        detector.prune();
        if succeeded {
            detector.record_success(&location.name);
        } else {
            detector.record_failure(&location.name);
        }
    }
}
