use std::sync::Arc;
use std::time::Duration;

use flotilla_events::{sensors, SensorEvent};
use flotilla_orchestrator::group::MembershipListener;
use flotilla_orchestrator::multigroup::{bucket_by_sensor, RescanWorker};
use flotilla_orchestrator::simulated::SimulatedFactory;
use flotilla_orchestrator::{
    Cluster, LocationRef, MemberSet, MembershipTracker, MultiGroup, Services, Unit, UnitRef,
};
use parking_lot::Mutex;
use tokio::sync::watch;

async fn cluster(services: &Services, size: usize) -> Arc<Cluster> {
    let factory = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)).named("m"));
    let cluster = Cluster::builder("web")
        .factory(factory)
        .initial_size(size)
        .build(services.clone())
        .unwrap();
    cluster.start(&[LocationRef::new("local")]).await.unwrap();
    cluster
}

/// Tag members by the parity of their name suffix.
fn tag_by_parity(services: &Services, cluster: &Cluster) {
    for member in cluster.members() {
        let name = member.display_name();
        let index: u64 = name.rsplit('-').next().and_then(|s| s.parse().ok()).unwrap();
        let tag = if index % 2 == 0 { "even" } else { "odd" };
        services
            .bus
            .publish(member.id(), sensors::BUCKET, serde_json::json!(tag));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn buckets_follow_cluster_resizes() {
    let services = Services::new();
    let cluster = cluster(&services, 3).await;
    tag_by_parity(&services, &cluster);

    let mg = MultiGroup::new(
        "parity",
        services.clone(),
        cluster.clone(),
        bucket_by_sensor(Arc::clone(&services.bus), sensors::BUCKET),
    );
    mg.rescan();
    assert_eq!(mg.bucket("even").unwrap().current_size(), 2);
    assert_eq!(mg.bucket("odd").unwrap().current_size(), 1);

    // Newest first: m-2 and m-1 go.
    cluster.resize(1).await.unwrap();
    let stats = mg.rescan();

    assert_eq!(stats.buckets_destroyed, 1);
    assert_eq!(mg.bucket_keys(), vec!["even"]);
    assert_eq!(mg.bucket("even").unwrap().current_size(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unmanaged_members_leave_buckets_before_rescan() {
    let services = Services::new();
    let cluster = cluster(&services, 2).await;
    tag_by_parity(&services, &cluster);

    let mg = MultiGroup::new(
        "parity",
        services.clone(),
        cluster.clone(),
        bucket_by_sensor(Arc::clone(&services.bus), sensors::BUCKET),
    );
    mg.rescan();
    let odd = mg.bucket("odd").unwrap();
    assert_eq!(odd.current_size(), 1);

    cluster.resize(1).await.unwrap();
    assert_eq!(odd.current_size(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_picks_up_new_members() {
    let services = Services::new();
    let cluster = cluster(&services, 1).await;
    tag_by_parity(&services, &cluster);

    let mg = MultiGroup::new(
        "parity",
        services.clone(),
        cluster.clone(),
        bucket_by_sensor(Arc::clone(&services.bus), sensors::BUCKET),
    );
    let (tx, rx) = watch::channel(false);
    let worker = RescanWorker::new(Arc::clone(&mg), Duration::from_millis(20)).spawn(rx);

    cluster.resize(2).await.unwrap();
    tag_by_parity(&services, &cluster);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(mg.bucket_keys(), vec!["even", "odd"]);

    tx.send(true).unwrap();
    worker.await.unwrap();
}

#[derive(Default)]
struct Counter {
    added: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    changes: Mutex<usize>,
}

impl MembershipListener for Counter {
    fn on_entity_added(&self, unit: &UnitRef) {
        self.added.lock().push(unit.display_name());
    }

    fn on_entity_removed(&self, unit: &UnitRef) {
        self.removed.lock().push(unit.display_name());
    }

    fn on_entity_changed(&self, _unit: &UnitRef, event: &SensorEvent) {
        if event.is_change() {
            *self.changes.lock() += 1;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn tracker_follows_cluster_membership() {
    let services = Services::new();
    let cluster = cluster(&services, 1).await;
    let counter = Arc::new(Counter::default());

    let tracker = MembershipTracker::builder(
        Arc::clone(cluster.group()),
        Arc::clone(&services.bus),
        counter.clone(),
    )
    .build();
    assert_eq!(*counter.added.lock(), vec!["m-0"]);

    cluster.resize(2).await.unwrap();
    assert_eq!(counter.added.lock().len(), 2);

    let newest = cluster
        .members()
        .into_iter()
        .find(|m| m.display_name() == "m-1")
        .unwrap();
    services
        .bus
        .publish(newest.id(), sensors::SERVICE_UP, serde_json::json!(false));
    assert_eq!(*counter.changes.lock(), 1);

    cluster.resize(1).await.unwrap();
    assert_eq!(*counter.removed.lock(), vec!["m-1"]);

    tracker.stop();
    cluster.resize(3).await.unwrap();
    assert_eq!(counter.added.lock().len(), 2);
}
