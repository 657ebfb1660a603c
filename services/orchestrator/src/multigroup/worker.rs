//! Periodic rescan worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use super::MultiGroup;

/// Rescans a [`MultiGroup`] on a fixed interval until shutdown.
pub struct RescanWorker {
    multigroup: Arc<MultiGroup>,
    interval: Duration,
}

impl RescanWorker {
    pub fn new(multigroup: Arc<MultiGroup>, interval: Duration) -> Self {
        Self {
            multigroup,
            interval,
        }
    }

    /// Run on a background task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(multigroup = %self.multigroup.name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting rescan worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Skip the immediate first tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.multigroup.rescan();
                    debug!(buckets_created = stats.buckets_created, buckets_destroyed = stats.buckets_destroyed, "Rescan tick");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Rescan worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::group::Group;
    use crate::multigroup::bucket_by_sensor;
    use crate::simulated::SimulatedUnit;
    use crate::unit::UnitRef;
    use flotilla_events::sensors;

    #[tokio::test]
    async fn rescans_periodically_and_stops_on_shutdown() {
        let services = Services::new();
        let source = Group::new("source", Arc::clone(&services.bus));
        let mg = MultiGroup::new(
            "tiers",
            services.clone(),
            source.clone(),
            bucket_by_sensor(Arc::clone(&services.bus), sensors::BUCKET),
        );

        let (tx, rx) = watch::channel(false);
        let handle = RescanWorker::new(Arc::clone(&mg), Duration::from_millis(10)).spawn(rx);

        let unit: UnitRef = SimulatedUnit::new("a", Arc::clone(&services.bus));
        services
            .bus
            .publish(unit.id(), sensors::BUCKET, serde_json::json!("gold"));
        source.add_member(unit);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mg.bucket_keys(), vec!["gold"]);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
