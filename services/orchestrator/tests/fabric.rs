use std::sync::Arc;

use flotilla_events::{sensors, SensorBus, ServiceState};
use flotilla_orchestrator::simulated::{SimulatedFactory, SimulatedUnit};
use flotilla_orchestrator::unit::factory_fn;
use flotilla_orchestrator::{
    Cluster, Fabric, LocationRef, MemberSet, OrchestratorError, Services, Unit, UnitRef,
};
use parking_lot::Mutex;

struct Harness {
    services: Services,
    fabric: Arc<Fabric>,
    members: Arc<SimulatedFactory>,
    clusters: Arc<Mutex<Vec<Arc<Cluster>>>>,
}

impl Harness {
    /// A fabric whose children are two-member clusters.
    fn new() -> Self {
        Self::with_members(SimulatedFactory::new)
    }

    fn with_members(members: impl FnOnce(Arc<SensorBus>) -> SimulatedFactory) -> Self {
        let services = Services::new();
        let members = Arc::new(members(Arc::clone(&services.bus)));
        let clusters = Arc::new(Mutex::new(Vec::new()));

        let factory = {
            let services = services.clone();
            let clusters = Arc::clone(&clusters);
            let members = Arc::clone(&members);
            factory_fn(move |ctx| {
                let cluster = Cluster::builder(format!("web-{}", ctx.location.name))
                    .factory(members.clone())
                    .initial_size(2)
                    .build(services.clone())?;
                clusters.lock().push(Arc::clone(&cluster));
                Ok(cluster as UnitRef)
            })
        };
        let fabric = Fabric::builder("web").factory(factory).build(services.clone()).unwrap();

        Self {
            services,
            fabric,
            members,
            clusters,
        }
    }

    fn cluster_at(&self, location: &str) -> Arc<Cluster> {
        self.clusters
            .lock()
            .iter()
            .find(|c| c.location().is_some_and(|l| l.name == location))
            .cloned()
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fabric_size_sums_child_clusters() {
    let h = Harness::new();
    h.fabric
        .start(&[LocationRef::new("us-east"), LocationRef::new("eu-west")])
        .await
        .unwrap();

    assert_eq!(h.fabric.current_size(), 2);
    assert_eq!(h.fabric.size(), 4);
    assert_eq!(
        h.services.bus.current_as::<u64>(h.fabric.id(), sensors::FABRIC_SIZE).unwrap(),
        4
    );

    h.cluster_at("eu-west").resize(5).await.unwrap();
    assert_eq!(h.fabric.size(), 7);

    h.fabric.stop().await.unwrap();
    assert_eq!(h.fabric.size(), 0);
    assert_eq!(
        h.services
            .bus
            .current_as::<ServiceState>(h.fabric.id(), sensors::SERVICE_STATE)
            .unwrap(),
        ServiceState::Stopped
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_reuses_children_and_locations() {
    let h = Harness::new();
    h.fabric.start(&[LocationRef::new("us-east")]).await.unwrap();
    h.fabric.stop().await.unwrap();
    assert_eq!(h.fabric.size(), 0);

    h.fabric.start(&[]).await.unwrap();
    assert_eq!(h.clusters.lock().len(), 1);
    assert_eq!(h.fabric.current_size(), 1);
    assert_eq!(h.fabric.size(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn regions_can_be_added_and_removed() {
    let h = Harness::new();
    h.fabric.start(&[LocationRef::new("us-east")]).await.unwrap();

    let added = h.fabric.add_region(LocationRef::new("ap-south")).await.unwrap();
    assert_eq!(h.fabric.current_size(), 2);
    assert_eq!(h.fabric.size(), 4);
    assert_eq!(h.fabric.locations().len(), 2);

    let child = h.cluster_at("ap-south");
    assert_eq!(child.id(), added);

    h.fabric.remove_region(added).await.unwrap();
    assert_eq!(h.fabric.current_size(), 1);
    assert_eq!(h.fabric.size(), 2);
    assert_eq!(h.fabric.locations().len(), 1);
    assert!(!h.services.registry.is_managed(added));
    assert_eq!(child.current_size(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_a_stranger_is_rejected() {
    let h = Harness::new();
    h.fabric.start(&[LocationRef::new("us-east")]).await.unwrap();

    let err = h.fabric.remove_region(flotilla_id::UnitId::new()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn children_are_managed_and_named_by_location() {
    let h = Harness::new();
    h.fabric.start(&[LocationRef::new("us-east")]).await.unwrap();

    let children = h.fabric.children();
    assert_eq!(children.len(), 1);
    assert!(h.services.registry.is_managed(children[0].id()));
    assert_eq!(children[0].display_name(), "web-us-east");
    assert_eq!(h.fabric.display_name(), "web");

    let members: Vec<_> = h.fabric.members().iter().map(|m| m.id()).collect();
    assert_eq!(members, vec![children[0].id()]);
    let placed: Vec<String> = children[0].locations().into_iter().map(|l| l.name).collect();
    assert_eq!(placed, vec!["us-east"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn retried_start_restarts_failed_child_in_place() {
    let h = Harness::with_members(|bus| SimulatedFactory::new(bus).fail_in_zone("eu"));
    let err = h
        .fabric
        .start(&[LocationRef::new("us"), LocationRef::new("eu")])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Aggregate(ref agg) if agg.len() == 1));
    assert_eq!(h.fabric.size(), 2);

    h.members.set_zone_failing("eu", false);
    h.fabric.start(&[]).await.unwrap();

    assert_eq!(h.clusters.lock().len(), 2);
    assert_eq!(h.fabric.children().len(), 2);
    assert_eq!(h.cluster_at("eu").current_size(), 2);
    assert_eq!(h.cluster_at("us").current_size(), 2);
    assert_eq!(h.fabric.size(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_region_creation_leaves_locations_untouched() {
    let services = Services::new();
    let factory = {
        let bus = Arc::clone(&services.bus);
        factory_fn(move |ctx| {
            if ctx.location.name == "ap-south" {
                anyhow::bail!("no capacity in {}", ctx.location.name);
            }
            Ok(SimulatedUnit::new(format!("edge-{}", ctx.location.name), Arc::clone(&bus)) as UnitRef)
        })
    };
    let fabric = Fabric::builder("edge").factory(factory).build(services.clone()).unwrap();
    fabric.start(&[LocationRef::new("us-east")]).await.unwrap();

    let err = fabric.add_region(LocationRef::new("ap-south")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Configuration(_)));
    let names: Vec<String> = fabric.locations().into_iter().map(|l| l.name).collect();
    assert_eq!(names, vec!["us-east"]);
    assert_eq!(fabric.children().len(), 1);

    // A later start has nothing left to fill.
    fabric.start(&[]).await.unwrap();
    assert_eq!(fabric.children().len(), 1);
}
