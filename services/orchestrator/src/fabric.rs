//! Multi-location fan-out.
//!
//! A [`Fabric`] runs one child per location, typically a cluster, and
//! aggregates their sizes into `fabric.size`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use flotilla_events::{sensors, ServiceState};
use flotilla_id::{SubscriptionId, UnitId};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::context::Services;
use crate::error::{AggregateError, OrchestratorError, OrchestratorResult, UnitFailure};
use crate::group::Group;
use crate::location::LocationRef;
use crate::unit::{
    next_creation_seq, MemberSet, PlacementContext, Startable, Unit, UnitFactory, UnitRef,
};

#[derive(Debug, Default)]
struct FabricState {
    locations: Vec<LocationRef>,
    started: HashSet<UnitId>,
    next_index: u64,
}

/// One child per location, started together.
pub struct Fabric {
    id: UnitId,
    name: String,
    seq: u64,
    services: Services,
    factory: Arc<dyn UnitFactory>,
    overrides: serde_json::Map<String, serde_json::Value>,
    group: Arc<Group>,
    state: Mutex<FabricState>,

    /// `group.size` subscription per child.
    size_subs: Mutex<HashMap<UnitId, SubscriptionId>>,
    this: Weak<Fabric>,
}

impl Fabric {
    pub fn builder(name: impl Into<String>) -> FabricBuilder {
        FabricBuilder {
            name: name.into(),
            factory: None,
            children: Vec::new(),
            overrides: serde_json::Map::new(),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    pub fn children(&self) -> Vec<UnitRef> {
        self.group.children()
    }

    pub fn locations(&self) -> Vec<LocationRef> {
        self.state.lock().locations.clone()
    }

    /// Sum of every child's `group.size`.
    pub fn size(&self) -> u64 {
        self.group
            .children()
            .iter()
            .map(|child| {
                self.services
                    .bus
                    .current_as::<u64>(child.id(), sensors::GROUP_SIZE)
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Start a child at every location.
    ///
    /// Children not started yet are paired with locations first; any
    /// location left over gets a new child.
    /// Every start runs to completion even if others fail.
    #[instrument(skip(self, locations), fields(fabric_id = %self.id, fabric = %self.name))]
    pub async fn start(&self, locations: &[LocationRef]) -> OrchestratorResult<()> {
        let locations = {
            let mut state = self.state.lock();
            if !locations.is_empty() {
                state.locations = locations.to_vec();
            }
            state.locations.clone()
        };
        if locations.is_empty() {
            return Err(OrchestratorError::Configuration(format!(
                "fabric {} has no locations",
                self.name
            )));
        }

        self.publish_state(ServiceState::Starting);
        let assignments = self.assign(&locations);
        info!(
            locations = locations.len(),
            starts = assignments.len(),
            "Starting fabric"
        );

        let this = self
            .this
            .upgrade()
            .ok_or_else(|| OrchestratorError::Task(format!("fabric {} is being dropped", self.name)))?;
        let tasks: Vec<_> = assignments
            .into_iter()
            .map(|(child, location)| {
                let fabric = Arc::clone(&this);
                async move { Ok(fabric.start_child(child, location).await) }
            })
            .collect();

        let mut configuration_error = None;
        let mut failures = Vec::new();
        for result in self.services.tasks.run_parallel("fabric.start", tasks).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(ChildFailure::Configuration(e))) => configuration_error = Some(e),
                Ok(Err(ChildFailure::Start(failure))) => failures.push(failure),
                Err(e) => failures.push(UnitFailure::new(None, None, e.into())),
            }
        }
        self.refresh_size();

        if let Some(e) = configuration_error {
            self.publish_state(ServiceState::OnFire);
            return Err(e);
        }
        match AggregateError::from_failures(failures) {
            Some(agg) => {
                warn!(failures = agg.len(), "Fabric started with failures");
                self.publish_state(ServiceState::OnFire);
                Err(agg.into())
            }
            None => {
                info!(children = self.group.current_size(), "Fabric started");
                self.publish_state(ServiceState::Running);
                Ok(())
            }
        }
    }

    /// Stop every startable child in parallel.
    #[instrument(skip(self), fields(fabric_id = %self.id, fabric = %self.name))]
    pub async fn stop(&self) -> OrchestratorResult<()> {
        self.publish_state(ServiceState::Stopping);
        let children: Vec<UnitRef> = self
            .group
            .children()
            .into_iter()
            .filter(|c| c.is_startable())
            .collect();
        info!(children = children.len(), "Stopping fabric");

        let tasks: Vec<_> = children
            .iter()
            .map(|child| {
                let child = Arc::clone(child);
                async move {
                    let unit_id = child.id();
                    child
                        .stop()
                        .await
                        .map_err(|source| OrchestratorError::StopFailed { unit_id, source })
                }
            })
            .collect();

        let failures: Vec<UnitFailure> = self
            .services
            .tasks
            .run_parallel("fabric.stop", tasks)
            .await
            .into_iter()
            .zip(&children)
            .filter_map(|(result, child)| {
                result
                    .err()
                    .map(|e| UnitFailure::new(Some(child.id()), None, e.into()))
            })
            .collect();

        {
            let mut state = self.state.lock();
            for child in &children {
                state.started.remove(&child.id());
            }
        }
        self.refresh_size();
        self.publish_state(ServiceState::Stopped);

        match AggregateError::from_failures(failures) {
            Some(agg) => Err(agg.into()),
            None => Ok(()),
        }
    }

    /// Add a location at runtime and start a child there.
    #[instrument(skip(self, location), fields(fabric_id = %self.id, location = %location))]
    pub async fn add_region(&self, location: LocationRef) -> OrchestratorResult<UnitId> {
        let index = {
            let mut state = self.state.lock();
            let index = state.next_index;
            state.next_index += 1;
            index
        };

        let child = self.create_child(&location, index).await?;
        self.state.lock().locations.push(location.clone());
        let unit_id = child.id();
        match self.start_child(Some(child), location).await {
            Ok(()) => {
                self.refresh_size();
                info!(unit_id = %unit_id, "Region added");
                Ok(unit_id)
            }
            Err(ChildFailure::Configuration(e)) => Err(e),
            Err(ChildFailure::Start(failure)) => {
                Err(AggregateError::from_failures(vec![failure])
                    .map(OrchestratorError::from)
                    .unwrap_or_else(|| OrchestratorError::Task("start failure vanished".to_string())))
            }
        }
    }

    /// Stop and discard the child with this id.
    #[instrument(skip(self), fields(fabric_id = %self.id))]
    pub async fn remove_region(&self, child_id: UnitId) -> OrchestratorResult<()> {
        let child = self
            .group
            .children()
            .into_iter()
            .find(|c| c.id() == child_id)
            .ok_or_else(|| {
                OrchestratorError::InvalidArgument(format!(
                    "{} is not a child of fabric {}",
                    child_id, self.name
                ))
            })?;

        let stopped = if child.is_startable() {
            child.stop().await
        } else {
            Ok(())
        };

        let child_locations = child.locations();
        {
            let mut state = self.state.lock();
            state.started.remove(&child_id);
            state.locations.retain(|l| !child_locations.contains(l));
        }
        self.detach_child(child_id);
        self.services.registry.unmanage(child_id);
        self.refresh_size();
        info!(unit_id = %child_id, "Region removed");

        stopped.map_err(|source| OrchestratorError::StopFailed {
            unit_id: child_id,
            source,
        })
    }

    /// Pair children with the locations they should start at.
    ///
    /// A child already bound to a location restarts there. Unbound children
    /// fill the locations nobody covers, then cycle through all of them.
    fn assign(&self, locations: &[LocationRef]) -> Vec<(Option<UnitRef>, LocationRef)> {
        let started = self.state.lock().started.clone();
        let (running, pending): (Vec<UnitRef>, Vec<UnitRef>) = self
            .group
            .children()
            .into_iter()
            .filter(|c| c.is_startable())
            .partition(|c| started.contains(&c.id()));

        let mut covered: Vec<LocationRef> = running.iter().flat_map(|c| c.locations()).collect();
        let mut assignments: Vec<(Option<UnitRef>, LocationRef)> = Vec::new();
        let mut unbound = Vec::new();
        for child in pending {
            match child.locations().into_iter().next() {
                Some(bound) => {
                    covered.push(bound.clone());
                    assignments.push((Some(child), bound));
                }
                None => unbound.push(child),
            }
        }

        let open: Vec<LocationRef> = locations
            .iter()
            .filter(|l| !covered.contains(l))
            .cloned()
            .collect();
        for (i, child) in unbound.into_iter().enumerate() {
            let location = open
                .get(i)
                .cloned()
                .unwrap_or_else(|| locations[i % locations.len()].clone());
            covered.push(location.clone());
            assignments.push((Some(child), location));
        }

        for location in locations {
            if !covered.contains(location) {
                assignments.push((None, location.clone()));
            }
        }
        assignments
    }

    async fn create_child(&self, location: &LocationRef, index: u64) -> OrchestratorResult<UnitRef> {
        let ctx = PlacementContext {
            owner: self.id,
            location: location.clone(),
            member_index: index,
            overrides: self.overrides.clone(),
        };
        let child = self.factory.create(&ctx).await.map_err(|e| {
            OrchestratorError::Configuration(format!(
                "fabric {} could not create a child for {}: {:#}",
                self.name, location, e
            ))
        })?;

        if !child.is_startable() {
            return Err(OrchestratorError::Configuration(format!(
                "fabric {} factory produced {} which cannot be started",
                self.name,
                child.id()
            )));
        }

        self.services.registry.manage(Arc::clone(&child));
        self.attach_child(Arc::clone(&child));
        debug!(unit_id = %child.id(), location = %location, "Fabric child created");
        Ok(child)
    }

    async fn start_child(&self, child: Option<UnitRef>, location: LocationRef) -> Result<(), ChildFailure> {
        let child = match child {
            Some(child) => child,
            None => {
                let index = {
                    let mut state = self.state.lock();
                    let index = state.next_index;
                    state.next_index += 1;
                    index
                };
                self.create_child(&location, index)
                    .await
                    .map_err(ChildFailure::Configuration)?
            }
        };
        let unit_id = child.id();

        match child.start(std::slice::from_ref(&location)).await {
            Ok(()) => {
                self.state.lock().started.insert(unit_id);
                debug!(unit_id = %unit_id, location = %location, "Fabric child started");
                Ok(())
            }
            Err(cause) => {
                warn!(unit_id = %unit_id, location = %location, error = %format!("{:#}", cause), "Fabric child failed to start");
                Err(ChildFailure::Start(UnitFailure::new(
                    Some(unit_id),
                    Some(location.name.clone()),
                    cause,
                )))
            }
        }
    }

    /// Make `child` a member and follow its size.
    fn attach_child(&self, child: UnitRef) {
        let child_id = child.id();
        self.group.add_member(child);

        let weak = self.this.clone();
        let sub = self
            .services
            .bus
            .subscribe(child_id, sensors::GROUP_SIZE, move |_| {
                if let Some(fabric) = weak.upgrade() {
                    fabric.refresh_size();
                }
            });
        if let Some(old) = self.size_subs.lock().insert(child_id, sub) {
            self.services.bus.unsubscribe(old);
        }
    }

    fn detach_child(&self, child_id: UnitId) {
        self.group.remove_child(child_id);
        if let Some(sub) = self.size_subs.lock().remove(&child_id) {
            self.services.bus.unsubscribe(sub);
        }
    }

    fn refresh_size(&self) {
        let size = self.size();
        self.services
            .bus
            .publish(self.id, sensors::FABRIC_SIZE, serde_json::json!(size));
    }

    fn publish_state(&self, state: ServiceState) {
        self.services
            .bus
            .publish(self.id, sensors::SERVICE_STATE, serde_json::json!(state));
        self.services.bus.publish(
            self.id,
            sensors::SERVICE_UP,
            serde_json::json!(state == ServiceState::Running),
        );
    }
}

enum ChildFailure {
    /// Creation failed or produced an unstartable unit; fails the whole start.
    Configuration(OrchestratorError),
    Start(UnitFailure),
}

impl MemberSet for Fabric {
    fn members(&self) -> Vec<UnitRef> {
        self.group.members()
    }

    fn has_member(&self, id: UnitId) -> bool {
        self.group.has_member(id)
    }

    fn current_size(&self) -> usize {
        self.group.current_size()
    }
}

#[async_trait]
impl Startable for Fabric {
    async fn start(&self, locations: &[LocationRef]) -> Result<()> {
        Fabric::start(self, locations).await.map_err(Into::into)
    }

    async fn stop(&self) -> Result<()> {
        Fabric::stop(self).await.map_err(Into::into)
    }
}

impl Unit for Fabric {
    fn id(&self) -> UnitId {
        self.id
    }

    fn creation_seq(&self) -> u64 {
        self.seq
    }

    fn locations(&self) -> Vec<LocationRef> {
        Fabric::locations(self)
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        for (_, sub) in self.size_subs.get_mut().drain() {
            self.services.bus.unsubscribe(sub);
        }
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("children", &self.group.children().len())
            .finish()
    }
}

/// Configures and creates a [`Fabric`].
pub struct FabricBuilder {
    name: String,
    factory: Option<Arc<dyn UnitFactory>>,
    children: Vec<UnitRef>,
    overrides: serde_json::Map<String, serde_json::Value>,
}

impl FabricBuilder {
    pub fn factory(mut self, factory: Arc<dyn UnitFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// A child to use before creating new ones.
    pub fn child(mut self, child: UnitRef) -> Self {
        self.children.push(child);
        self
    }

    pub fn overrides(mut self, overrides: serde_json::Map<String, serde_json::Value>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn build(self, services: Services) -> OrchestratorResult<Arc<Fabric>> {
        let factory = self.factory.ok_or_else(|| {
            OrchestratorError::Configuration(format!("fabric {} has no child factory", self.name))
        })?;

        let id = UnitId::new();
        let group = Group::with_id(id, self.name.clone(), Arc::clone(&services.bus));
        group.watch_lifecycle();

        let fabric = Arc::new_cyclic(|this| Fabric {
            id,
            name: self.name,
            seq: next_creation_seq(),
            services,
            factory,
            overrides: self.overrides,
            group,
            state: Mutex::new(FabricState::default()),
            size_subs: Mutex::new(HashMap::new()),
            this: this.clone(),
        });

        for child in self.children {
            fabric.services.registry.manage(Arc::clone(&child));
            fabric.attach_child(child);
        }
        fabric.services.registry.manage(Arc::clone(&fabric) as UnitRef);
        fabric.refresh_size();
        Ok(fabric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedFactory, SimulatedUnit};

    fn regions(names: &[&str]) -> Vec<LocationRef> {
        names.iter().map(|n| LocationRef::new(*n)).collect()
    }

    #[tokio::test]
    async fn creates_one_child_per_location() {
        let services = Services::new();
        let factory = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)));
        let fabric = Fabric::builder("edge")
            .factory(factory.clone())
            .build(services.clone())
            .unwrap();

        let locs = regions(&["us", "eu", "ap"]);
        fabric.start(&locs).await.unwrap();

        assert_eq!(factory.created_count(), 3);
        let children = fabric.children();
        assert_eq!(children.len(), 3);
        for child in &children {
            assert_eq!(child.locations().len(), 1);
        }
        let mut started_at: Vec<_> = children.iter().map(|c| c.locations()[0].name.clone()).collect();
        started_at.sort();
        assert_eq!(started_at, vec!["ap", "eu", "us"]);
        let child_ids: Vec<UnitId> = children.iter().map(|c| c.id()).collect();
        assert_eq!(fabric.group().member_ids(), child_ids);
    }

    #[tokio::test]
    async fn existing_children_take_locations_first() {
        let services = Services::new();
        let factory = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)));
        let existing = SimulatedUnit::new("existing", Arc::clone(&services.bus));
        let fabric = Fabric::builder("edge")
            .factory(factory.clone())
            .child(existing.clone())
            .build(services.clone())
            .unwrap();

        let locs = regions(&["us", "eu"]);
        fabric.start(&locs).await.unwrap();

        assert_eq!(existing.locations(), vec![locs[0].clone()]);
        assert_eq!(factory.created_count(), 1);
        assert_eq!(fabric.children().len(), 2);
    }

    #[tokio::test]
    async fn non_startable_child_is_configuration_error() {
        let services = Services::new();
        let factory = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)).non_startable());
        let fabric = Fabric::builder("edge")
            .factory(factory)
            .build(services.clone())
            .unwrap();

        let err = fabric.start(&regions(&["us"])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }

    #[tokio::test]
    async fn one_failing_location_does_not_cancel_others() {
        let services = Services::new();
        let factory = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)).fail_in_zone("eu"));
        let fabric = Fabric::builder("edge")
            .factory(factory.clone())
            .build(services.clone())
            .unwrap();

        let err = fabric.start(&regions(&["us", "eu", "ap"])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Aggregate(ref agg) if agg.len() == 1));
        let running = factory.created_units().iter().filter(|u| u.is_running()).count();
        assert_eq!(running, 2);
    }

    #[tokio::test]
    async fn stop_skips_non_startable_children() {
        let services = Services::new();
        let factory = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)));
        let extra = SimulatedUnit::builder("extra", Arc::clone(&services.bus))
            .non_startable()
            .build();
        let fabric = Fabric::builder("edge")
            .factory(factory.clone())
            .child(extra.clone())
            .build(services.clone())
            .unwrap();

        fabric.start(&regions(&["us"])).await.unwrap();
        fabric.stop().await.unwrap();

        assert_eq!(extra.stop_count(), 0);
        assert!(factory.created_units().iter().all(|u| u.stop_count() == 1));
    }

    #[tokio::test]
    async fn remove_region_rejects_strangers() {
        let services = Services::new();
        let factory = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)));
        let fabric = Fabric::builder("edge")
            .factory(factory)
            .build(services.clone())
            .unwrap();

        let err = fabric.remove_region(UnitId::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn add_and_remove_region() {
        let services = Services::new();
        let factory = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)));
        let fabric = Fabric::builder("edge")
            .factory(factory.clone())
            .build(services.clone())
            .unwrap();
        fabric.start(&regions(&["us"])).await.unwrap();

        let added = fabric.add_region(LocationRef::new("eu")).await.unwrap();
        assert_eq!(fabric.children().len(), 2);
        assert_eq!(fabric.locations().len(), 2);

        fabric.remove_region(added).await.unwrap();
        assert_eq!(fabric.children().len(), 1);
        assert_eq!(fabric.locations().len(), 1);
        assert!(!services.registry.is_managed(added));
    }
}
