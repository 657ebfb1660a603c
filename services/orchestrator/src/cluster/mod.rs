//! Resizable cluster of homogeneous units.
//!
//! A [`Cluster`] keeps a target number of units, created by a
//! [`UnitFactory`], running at a single location, optionally spread across
//! the availability zones of that location.
//!
//! ## Resizing
//!
//! Resizes are serialized by an async mutex, so concurrent requests for the
//! same size converge on one set of creations. Membership reads never wait
//! on it. Growth creates units in parallel; each creation task folds its own
//! outcome into membership, quarantine or the registry, so a caller that
//! stops waiting never leaks units.
//!
//! ```text
//! resize(n) ──lock──▶ grow(n - current) ──▶ [create ▶ start ▶ add member]*
//!                   └▶ shrink(current - n) ─▶ [stop ▶ remove ▶ unmanage]*
//! ```

mod resize;
mod zones;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::Result;
use async_trait::async_trait;
use flotilla_events::{sensors, ConvergenceState, ServiceState};
use flotilla_id::UnitId;
use flotilla_reconcile::{
    newest_first, oldest_first, DetectorConfig, QuorumCheck, ZoneFailureDetector,
};
use parking_lot::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::config::{ClusterSpec, RemovalStrategyName};
use crate::context::Services;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::group::{Group, QuarantineGroup};
use crate::location::{LocationRef, ZoneProvider, ZoneSelection};
use crate::unit::{
    next_creation_seq, MemberSet, Resizable, Startable, Unit, UnitFactory, UnitRef,
};

/// Chooses one unit to remove out of the candidates, by index.
pub type RemovalStrategy = Arc<dyn Fn(&[UnitRef]) -> Option<usize> + Send + Sync>;

/// Decides whether a start failure sends the unit to quarantine.
pub type QuarantineFilter = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Remove the most recently created unit first.
pub fn newest_first_strategy() -> RemovalStrategy {
    Arc::new(|candidates: &[UnitRef]| newest_first(candidates, |u| u.creation_seq()))
}

/// Remove the oldest unit first.
pub fn oldest_first_strategy() -> RemovalStrategy {
    Arc::new(|candidates: &[UnitRef]| oldest_first(candidates, |u| u.creation_seq()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct ClusterState {
    lifecycle: Lifecycle,
    location: Option<LocationRef>,
    zones: Vec<LocationRef>,
    target_size: usize,
}

/// A resizable group of units created from one factory.
pub struct Cluster {
    id: UnitId,
    name: String,
    seq: u64,
    services: Services,

    factory: Arc<dyn UnitFactory>,
    first_member_factory: Option<Arc<dyn UnitFactory>>,
    member_overrides: serde_json::Map<String, serde_json::Value>,
    first_member_overrides: Option<serde_json::Map<String, serde_json::Value>>,

    initial_size: usize,
    initial_quorum: QuorumCheck,
    up_quorum: QuorumCheck,
    removal_strategy: RwLock<RemovalStrategy>,

    quarantine_enabled: bool,
    quarantine_filter: QuarantineFilter,
    quarantine: OnceLock<Arc<QuarantineGroup>>,

    zone_selection: Option<ZoneSelection>,
    zone_provider: Option<Arc<dyn ZoneProvider>>,
    detector: Mutex<ZoneFailureDetector>,

    /// Location each member was started at.
    placements: Mutex<HashMap<UnitId, LocationRef>>,

    group: Arc<Group>,
    state: Mutex<ClusterState>,
    next_member_index: AtomicU64,
    first_member: Mutex<Option<UnitId>>,

    /// Serializes resize, replace and stop.
    resize_lock: tokio::sync::Mutex<()>,

    /// Handle for creation tasks that must outlive a borrowed `&self`.
    this: Weak<Cluster>,
}

impl Cluster {
    pub fn builder(name: impl Into<String>) -> ClusterBuilder {
        ClusterBuilder::new(name)
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

    pub fn target_size(&self) -> usize {
        self.state.lock().target_size
    }

    pub fn location(&self) -> Option<LocationRef> {
        self.state.lock().location.clone()
    }

    /// Availability zones chosen at start. Empty when zones are disabled.
    pub fn zones(&self) -> Vec<LocationRef> {
        self.state.lock().zones.clone()
    }

    /// Location a member was started at.
    pub fn placement_of(&self, id: UnitId) -> Option<LocationRef> {
        self.placements.lock().get(&id).cloned()
    }

    /// Number of current members started in the named zone.
    pub fn members_in_zone(&self, zone: &str) -> usize {
        let placements = self.placements.lock();
        self.group
            .member_ids()
            .iter()
            .filter(|id| placements.get(id).is_some_and(|loc| loc.name == zone))
            .count()
    }

    /// Zones currently flagged by the failure detector.
    pub fn avoided_zones(&self) -> Vec<String> {
        let zones = self.zones();
        self.detector
            .lock()
            .failed_zones(zones.iter().map(|z| z.name.as_str()))
    }

    /// The quarantine group, once the first unit has been quarantined.
    pub fn quarantine_group(&self) -> Option<Arc<QuarantineGroup>> {
        self.quarantine.get().cloned()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Running
    }

    pub fn set_removal_strategy(&self, strategy: RemovalStrategy) {
        *self.removal_strategy.write() = strategy;
    }

    /// Add an existing unit as a member, outside of any resize.
    pub fn add_member(&self, unit: UnitRef) -> bool {
        let added = self.group.add_member(unit);
        self.publish_health();
        added
    }

    /// Remove a member, outside of any resize. The unit is not stopped.
    pub fn remove_member(&self, id: UnitId) -> bool {
        let removed = self.group.remove_member(id);
        if removed {
            self.placements.lock().remove(&id);
        }
        self.publish_health();
        removed
    }

    /// Bind the cluster to its location and create the initial members.
    ///
    /// Succeeds when the initial quorum holds, even if some members failed.
    #[instrument(skip(self, locations), fields(cluster_id = %self.id, cluster = %self.name))]
    pub async fn start(&self, locations: &[LocationRef]) -> OrchestratorResult<()> {
        let location = match locations {
            [location] => location.clone(),
            _ => {
                return Err(OrchestratorError::Configuration(format!(
                    "cluster {} requires exactly one location, got {}",
                    self.name,
                    locations.len()
                )))
            }
        };

        {
            let mut state = self.state.lock();
            if let Some(bound) = &state.location {
                if bound != &location {
                    return Err(OrchestratorError::Configuration(format!(
                        "cluster {} is already bound to {}, cannot start at {}",
                        self.name, bound, location
                    )));
                }
            }
            if state.location.is_some() && state.lifecycle == Lifecycle::Running {
                return Ok(());
            }
            state.location = Some(location.clone());
            state.lifecycle = Lifecycle::Starting;
        }
        self.publish_state(ServiceState::Starting);
        info!(location = %location, initial_size = self.initial_size, "Starting cluster");

        if let Err(e) = self.bind_zones(&location).await {
            self.state.lock().lifecycle = Lifecycle::Created;
            self.publish_state(ServiceState::OnFire);
            return Err(e);
        }

        let outcome = self.resize(self.initial_size).await;
        let achieved = self.group.current_size();

        if !self.initial_quorum.is_quorate(achieved, self.initial_size) {
            warn!(
                achieved,
                requested = self.initial_size,
                "Initial quorum not met"
            );
            // Stays bound but not started, so a retry grows again.
            self.state.lock().lifecycle = Lifecycle::Created;
            self.publish_state(ServiceState::OnFire);
            let causes = match outcome {
                Err(e) => match e {
                    OrchestratorError::Capacity { causes, .. } => causes,
                    other => return Err(other),
                },
                Ok(_) => Vec::new(),
            };
            return Err(OrchestratorError::Capacity {
                requested: self.initial_size,
                achieved,
                causes,
            });
        }

        if let Err(e) = &outcome {
            warn!(error = %e, achieved, "Cluster started with partial capacity");
        }

        self.state.lock().lifecycle = Lifecycle::Running;
        self.publish_state(ServiceState::Running);
        info!(achieved, "Cluster started");
        Ok(())
    }

    /// Wait for any in-flight resize, then stop and discard every member.
    ///
    /// Quarantined units stay in the quarantine group.
    #[instrument(skip(self), fields(cluster_id = %self.id, cluster = %self.name))]
    pub async fn stop(&self) -> OrchestratorResult<()> {
        let _guard = self.resize_lock.lock().await;

        self.state.lock().lifecycle = Lifecycle::Stopping;
        self.publish_state(ServiceState::Stopping);
        info!(members = self.group.current_size(), "Stopping cluster");

        let outcome = self.resize_locked(0).await;

        self.state.lock().lifecycle = Lifecycle::Stopped;
        self.publish_state(ServiceState::Stopped);
        info!("Cluster stopped");
        outcome.map(|_| ())
    }

    pub(crate) fn arc(&self) -> OrchestratorResult<Arc<Cluster>> {
        self.this
            .upgrade()
            .ok_or_else(|| OrchestratorError::Task(format!("cluster {} is being dropped", self.name)))
    }

    pub(crate) fn quarantine_or_init(&self) -> Arc<QuarantineGroup> {
        Arc::clone(self.quarantine.get_or_init(|| {
            info!(cluster_id = %self.id, "Creating quarantine group");
            let quarantine =
                QuarantineGroup::new(format!("{}-quarantine", self.name), self.services.clone());
            self.group.add_child(Arc::clone(quarantine.group()) as UnitRef);
            Arc::new(quarantine)
        }))
    }

    fn publish_state(&self, state: ServiceState) {
        self.services
            .bus
            .publish(self.id, sensors::SERVICE_STATE, serde_json::json!(state));
        self.publish_health();
    }

    /// Publish `service.up` and `cluster.convergence` from current size.
    fn publish_health(&self) {
        let (target, lifecycle) = {
            let state = self.state.lock();
            (state.target_size, state.lifecycle)
        };
        let current = self.group.current_size();

        let up = matches!(lifecycle, Lifecycle::Running | Lifecycle::Starting)
            && self.up_quorum.is_quorate(current, target);
        self.services
            .bus
            .publish(self.id, sensors::SERVICE_UP, serde_json::json!(up));

        let convergence = if current == target {
            ConvergenceState::Converged
        } else {
            ConvergenceState::Diverged
        };
        self.services.bus.publish(
            self.id,
            sensors::CLUSTER_CONVERGENCE,
            serde_json::json!(convergence),
        );
    }
}

impl MemberSet for Cluster {
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
impl Resizable for Cluster {
    async fn resize(&self, desired: usize) -> OrchestratorResult<usize> {
        Cluster::resize(self, desired).await
    }
}

#[async_trait]
impl Startable for Cluster {
    async fn start(&self, locations: &[LocationRef]) -> Result<()> {
        Cluster::start(self, locations).await.map_err(Into::into)
    }

    async fn stop(&self) -> Result<()> {
        Cluster::stop(self).await.map_err(Into::into)
    }
}

impl Unit for Cluster {
    fn id(&self) -> UnitId {
        self.id
    }

    fn creation_seq(&self) -> u64 {
        self.seq
    }

    fn locations(&self) -> Vec<LocationRef> {
        self.location().into_iter().collect()
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lifecycle", &state.lifecycle)
            .field("target_size", &state.target_size)
            .field("current_size", &self.group.current_size())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures and creates a [`Cluster`].
pub struct ClusterBuilder {
    name: String,
    factory: Option<Arc<dyn UnitFactory>>,
    first_member_factory: Option<Arc<dyn UnitFactory>>,
    member_overrides: serde_json::Map<String, serde_json::Value>,
    first_member_overrides: Option<serde_json::Map<String, serde_json::Value>>,
    initial_size: usize,
    initial_quorum: Option<QuorumCheck>,
    up_quorum: QuorumCheck,
    removal_strategy: RemovalStrategy,
    quarantine_enabled: bool,
    quarantine_filter: Option<QuarantineFilter>,
    zone_selection: Option<ZoneSelection>,
    zone_provider: Option<Arc<dyn ZoneProvider>>,
    detector: DetectorConfig,
}

impl ClusterBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factory: None,
            first_member_factory: None,
            member_overrides: serde_json::Map::new(),
            first_member_overrides: None,
            initial_size: 1,
            initial_quorum: None,
            up_quorum: QuorumCheck::AtLeastOneUnlessEmpty,
            removal_strategy: newest_first_strategy(),
            quarantine_enabled: false,
            quarantine_filter: None,
            zone_selection: None,
            zone_provider: None,
            detector: DetectorConfig::default(),
        }
    }

    /// Builder populated from a declarative spec. The factory still has to
    /// be supplied.
    pub fn from_spec(spec: &ClusterSpec) -> OrchestratorResult<Self> {
        let up_quorum = spec
            .up_quorum_check
            .parse::<QuorumCheck>()
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;

        let mut builder = Self::new(spec.name.clone())
            .initial_size(spec.initial_size)
            .up_quorum(up_quorum)
            .member_overrides(spec.member_spec.clone())
            .quarantine_failed(spec.quarantine_failed_entities)
            .detector(spec.zone_failure_detector.to_config());

        if let Some(first) = &spec.first_member_spec {
            builder = builder.first_member_overrides(first.clone());
        }
        if let Some(n) = spec.initial_quorum_size {
            builder = builder.initial_quorum(QuorumCheck::AtLeast(n));
        }
        if let Some(needle) = spec.quarantine_filter.clone() {
            builder = builder.quarantine_filter(move |e: &anyhow::Error| {
                format!("{:#}", e).contains(&needle)
            });
        }
        builder = match spec.removal_strategy {
            RemovalStrategyName::NewestFirst => builder.removal_strategy(newest_first_strategy()),
            RemovalStrategyName::OldestFirst => builder.removal_strategy(oldest_first_strategy()),
        };
        if spec.enable_availability_zones {
            let selection = if spec.availability_zone_names.is_empty() {
                ZoneSelection::Count(spec.num_availability_zones.unwrap_or(2))
            } else {
                ZoneSelection::Names(spec.availability_zone_names.clone())
            };
            builder = builder.zones(selection);
        }
        Ok(builder)
    }

    pub fn factory(mut self, factory: Arc<dyn UnitFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Factory used for member index 0 only.
    pub fn first_member_factory(mut self, factory: Arc<dyn UnitFactory>) -> Self {
        self.first_member_factory = Some(factory);
        self
    }

    pub fn member_overrides(mut self, overrides: serde_json::Map<String, serde_json::Value>) -> Self {
        self.member_overrides = overrides;
        self
    }

    pub fn first_member_overrides(
        mut self,
        overrides: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.first_member_overrides = Some(overrides);
        self
    }

    pub fn initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    /// Defaults to [`QuorumCheck::All`].
    pub fn initial_quorum(mut self, check: QuorumCheck) -> Self {
        self.initial_quorum = Some(check);
        self
    }

    pub fn up_quorum(mut self, check: QuorumCheck) -> Self {
        self.up_quorum = check;
        self
    }

    pub fn removal_strategy(mut self, strategy: RemovalStrategy) -> Self {
        self.removal_strategy = strategy;
        self
    }

    pub fn quarantine_failed(mut self, enabled: bool) -> Self {
        self.quarantine_enabled = enabled;
        self
    }

    /// Only failures matching `filter` are quarantined. Defaults to all.
    pub fn quarantine_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.quarantine_filter = Some(Arc::new(filter));
        self
    }

    pub fn zones(mut self, selection: ZoneSelection) -> Self {
        self.zone_selection = Some(selection);
        self
    }

    pub fn zone_provider(mut self, provider: Arc<dyn ZoneProvider>) -> Self {
        self.zone_provider = Some(provider);
        self
    }

    pub fn detector(mut self, config: DetectorConfig) -> Self {
        self.detector = config;
        self
    }

    pub fn build(self, services: Services) -> OrchestratorResult<Arc<Cluster>> {
        let factory = self.factory.ok_or_else(|| {
            OrchestratorError::Configuration(format!("cluster {} has no member factory", self.name))
        })?;
        if self.zone_selection.is_some() && self.zone_provider.is_none() {
            return Err(OrchestratorError::Configuration(format!(
                "cluster {} enables availability zones without a zone provider",
                self.name
            )));
        }

        let id = UnitId::new();
        let group = Group::with_id(id, self.name.clone(), Arc::clone(&services.bus));
        group.watch_lifecycle();

        let cluster = Arc::new_cyclic(|this| Cluster {
            id,
            name: self.name,
            seq: next_creation_seq(),
            services,
            factory,
            first_member_factory: self.first_member_factory,
            member_overrides: self.member_overrides,
            first_member_overrides: self.first_member_overrides,
            initial_size: self.initial_size,
            initial_quorum: self.initial_quorum.unwrap_or(QuorumCheck::All),
            up_quorum: self.up_quorum,
            removal_strategy: RwLock::new(self.removal_strategy),
            quarantine_enabled: self.quarantine_enabled,
            quarantine_filter: self
                .quarantine_filter
                .unwrap_or_else(|| Arc::new(|_: &anyhow::Error| true)),
            quarantine: OnceLock::new(),
            zone_selection: self.zone_selection,
            zone_provider: self.zone_provider,
            detector: Mutex::new(ZoneFailureDetector::new(self.detector)),
            placements: Mutex::new(HashMap::new()),
            group,
            state: Mutex::new(ClusterState {
                lifecycle: Lifecycle::Created,
                location: None,
                zones: Vec::new(),
                target_size: 0,
            }),
            next_member_index: AtomicU64::new(0),
            first_member: Mutex::new(None),
            resize_lock: tokio::sync::Mutex::new(()),
            this: this.clone(),
        });

        cluster.services.registry.manage(Arc::clone(&cluster) as UnitRef);
        cluster.publish_state(ServiceState::Created);
        Ok(cluster)
    }
}

impl Cluster {
    fn next_index(&self) -> u64 {
        self.next_member_index.fetch_add(1, Ordering::SeqCst)
    }
}
