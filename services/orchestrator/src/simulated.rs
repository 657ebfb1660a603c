//! Simulated units for tests and development.
//!
//! Units live only in memory. Start and stop take a configurable delay and
//! can be made to fail, so orchestration behavior can be exercised without
//! provisioning anything.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use flotilla_events::{sensors, SensorBus, ServiceState};
use flotilla_id::UnitId;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::location::LocationRef;
use crate::unit::{next_creation_seq, PlacementContext, Startable, Unit, UnitFactory, UnitRef};

/// Override key read by [`SimulatedFactory`] for a per-unit start delay.
pub const START_DELAY_MS: &str = "start_delay_ms";

// =============================================================================
// Simulated unit
// =============================================================================

struct SimState {
    phase: ServiceState,
    locations: Vec<LocationRef>,
}

/// An in-memory unit.
pub struct SimulatedUnit {
    id: UnitId,
    seq: u64,
    name: String,
    bus: Arc<SensorBus>,
    start_delay: Duration,
    start_failure: Option<String>,
    fail_stop: bool,
    startable: bool,
    state: Mutex<SimState>,
    starts: AtomicU32,
    stops: AtomicU32,
}

impl SimulatedUnit {
    /// A unit that starts and stops instantly.
    pub fn new(name: impl Into<String>, bus: Arc<SensorBus>) -> Arc<Self> {
        Self::builder(name, bus).build()
    }

    pub fn builder(name: impl Into<String>, bus: Arc<SensorBus>) -> SimulatedUnitBuilder {
        SimulatedUnitBuilder {
            name: name.into(),
            bus,
            start_delay: Duration::ZERO,
            start_failure: None,
            fail_stop: false,
            startable: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> ServiceState {
        self.state.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == ServiceState::Running
    }

    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: ServiceState) {
        self.state.lock().phase = phase;
        self.bus
            .publish(self.id, sensors::SERVICE_STATE, serde_json::json!(phase));
        self.bus.publish(
            self.id,
            sensors::SERVICE_UP,
            serde_json::json!(phase == ServiceState::Running),
        );
    }
}

#[async_trait]
impl Startable for SimulatedUnit {
    async fn start(&self, locations: &[LocationRef]) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.set_phase(ServiceState::Starting);

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        if let Some(message) = &self.start_failure {
            self.set_phase(ServiceState::OnFire);
            bail!("{}: {}", self.name, message);
        }

        self.state.lock().locations = locations.to_vec();
        self.set_phase(ServiceState::Running);
        debug!(unit_id = %self.id, name = %self.name, "Simulated unit started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            self.set_phase(ServiceState::OnFire);
            bail!("{}: simulated stop failure", self.name);
        }

        self.set_phase(ServiceState::Stopped);
        debug!(unit_id = %self.id, name = %self.name, "Simulated unit stopped");
        Ok(())
    }
}

impl Unit for SimulatedUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn creation_seq(&self) -> u64 {
        self.seq
    }

    fn is_startable(&self) -> bool {
        self.startable
    }

    fn locations(&self) -> Vec<LocationRef> {
        self.state.lock().locations.clone()
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }
}

pub struct SimulatedUnitBuilder {
    name: String,
    bus: Arc<SensorBus>,
    start_delay: Duration,
    start_failure: Option<String>,
    fail_stop: bool,
    startable: bool,
}

impl SimulatedUnitBuilder {
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn fail_start(mut self, message: impl Into<String>) -> Self {
        self.start_failure = Some(message.into());
        self
    }

    pub fn fail_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn non_startable(mut self) -> Self {
        self.startable = false;
        self
    }

    pub fn build(self) -> Arc<SimulatedUnit> {
        Arc::new(SimulatedUnit {
            id: UnitId::new(),
            seq: next_creation_seq(),
            name: self.name,
            bus: self.bus,
            start_delay: self.start_delay,
            start_failure: self.start_failure,
            fail_stop: self.fail_stop,
            startable: self.startable,
            state: Mutex::new(SimState {
                phase: ServiceState::Created,
                locations: Vec::new(),
            }),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        })
    }
}

// =============================================================================
// Simulated factory
// =============================================================================

/// Factory for [`SimulatedUnit`]s with failure injection.
///
/// Creations are numbered from 1 in the order the factory is called.
pub struct SimulatedFactory {
    bus: Arc<SensorBus>,
    prefix: String,
    start_delay: Duration,
    fail_every: Option<u64>,
    fail_creations: HashSet<u64>,
    reject_creations: HashSet<u64>,
    failing_zones: RwLock<HashSet<String>>,
    fail_stops: bool,
    non_startable: bool,
    created: AtomicU64,
    units: Mutex<Vec<Arc<SimulatedUnit>>>,
}

impl SimulatedFactory {
    pub fn new(bus: Arc<SensorBus>) -> Self {
        Self {
            bus,
            prefix: "unit".to_string(),
            start_delay: Duration::ZERO,
            fail_every: None,
            fail_creations: HashSet::new(),
            reject_creations: HashSet::new(),
            failing_zones: RwLock::new(HashSet::new()),
            fail_stops: false,
            non_startable: false,
            created: AtomicU64::new(0),
            units: Mutex::new(Vec::new()),
        }
    }

    /// Name prefix for created units.
    pub fn named(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Units from every `n`th creation fail to start.
    pub fn fail_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// The unit from creation number `n` fails to start.
    pub fn fail_nth(mut self, n: u64) -> Self {
        self.fail_creations.insert(n);
        self
    }

    /// Creation number `n` fails in the factory itself.
    pub fn reject_nth(mut self, n: u64) -> Self {
        self.reject_creations.insert(n);
        self
    }

    /// Units placed in the named zone fail to start.
    pub fn fail_in_zone(self, zone: impl Into<String>) -> Self {
        self.set_zone_failing(zone, true);
        self
    }

    pub fn set_zone_failing(&self, zone: impl Into<String>, failing: bool) {
        let zone = zone.into();
        let mut zones = self.failing_zones.write();
        if failing {
            zones.insert(zone);
        } else {
            zones.remove(&zone);
        }
    }

    /// Every created unit fails to stop.
    pub fn fail_stops(mut self) -> Self {
        self.fail_stops = true;
        self
    }

    /// Every created unit reports itself as not startable.
    pub fn non_startable(mut self) -> Self {
        self.non_startable = true;
        self
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn created_units(&self) -> Vec<Arc<SimulatedUnit>> {
        self.units.lock().clone()
    }

    fn start_failure(&self, ordinal: u64, location: &LocationRef) -> Option<String> {
        if self.failing_zones.read().contains(&location.name) {
            return Some(format!("zone {} is failing", location.name));
        }
        if self.fail_creations.contains(&ordinal) {
            return Some(format!("creation {} set to fail", ordinal));
        }
        match self.fail_every {
            Some(n) if ordinal % n == 0 => Some(format!("every {} creations fail", n)),
            _ => None,
        }
    }
}

#[async_trait]
impl UnitFactory for SimulatedFactory {
    async fn create(&self, ctx: &PlacementContext) -> Result<UnitRef> {
        let ordinal = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject_creations.contains(&ordinal) {
            bail!("factory rejected creation {}", ordinal);
        }

        let delay = ctx
            .overrides
            .get(START_DELAY_MS)
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.start_delay);

        let mut builder = SimulatedUnit::builder(
            format!("{}-{}", self.prefix, ctx.member_index),
            Arc::clone(&self.bus),
        )
        .start_delay(delay);
        if let Some(message) = self.start_failure(ordinal, &ctx.location) {
            builder = builder.fail_start(message);
        }
        if self.fail_stops {
            builder = builder.fail_stop();
        }
        if self.non_startable {
            builder = builder.non_startable();
        }

        let unit = builder.build();
        info!(
            unit_id = %unit.id(),
            owner = %ctx.owner,
            location = %ctx.location,
            member_index = ctx.member_index,
            "Created simulated unit"
        );
        self.units.lock().push(Arc::clone(&unit));
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(location: &LocationRef, member_index: u64) -> PlacementContext {
        PlacementContext {
            owner: UnitId::new(),
            location: location.clone(),
            member_index,
            overrides: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn unit_start_publishes_sensors() {
        let bus = Arc::new(SensorBus::new());
        let unit = SimulatedUnit::new("a", Arc::clone(&bus));
        let loc = LocationRef::new("local");

        unit.start(std::slice::from_ref(&loc)).await.unwrap();
        assert!(unit.is_running());
        assert_eq!(unit.locations(), vec![loc]);
        assert_eq!(
            bus.current(unit.id(), sensors::SERVICE_UP),
            Some(serde_json::json!(true))
        );

        unit.stop().await.unwrap();
        assert_eq!(unit.phase(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn factory_injects_failures() {
        let bus = Arc::new(SensorBus::new());
        let factory = SimulatedFactory::new(Arc::clone(&bus)).fail_nth(2).reject_nth(3);
        let loc = LocationRef::new("local");

        let first = factory.create(&ctx(&loc, 0)).await.unwrap();
        assert!(first.start(&[]).await.is_ok());

        let second = factory.create(&ctx(&loc, 1)).await.unwrap();
        assert!(second.start(&[]).await.is_err());

        assert!(factory.create(&ctx(&loc, 2)).await.is_err());
        assert_eq!(factory.created_count(), 3);
        assert_eq!(factory.created_units().len(), 2);
    }

    #[tokio::test]
    async fn zone_failures_can_be_toggled() {
        let bus = Arc::new(SensorBus::new());
        let factory = SimulatedFactory::new(bus).fail_in_zone("zone-b");
        let region = LocationRef::new("region");
        let zone_b = LocationRef::child_of(&region, "zone-b");

        let unit = factory.create(&ctx(&zone_b, 0)).await.unwrap();
        assert!(unit.start(&[]).await.is_err());

        factory.set_zone_failing("zone-b", false);
        let unit = factory.create(&ctx(&zone_b, 1)).await.unwrap();
        assert!(unit.start(&[]).await.is_ok());
    }
}
