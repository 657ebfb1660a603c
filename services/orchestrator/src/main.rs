//! Flotilla daemon
//!
//! Loads a topology, runs its clusters and fabrics against simulated units
//! and keeps them at size until interrupted.
//!
//! ## Architecture
//!
//! - **Deployment**: clusters and fabrics built from the topology file
//! - **Rescan workers**: one per cluster, bucketing members by `bucket`
//! - **Shutdown**: ctrl-c stops the workers, then the deployment

use std::sync::Arc;

use anyhow::Result;
use flotilla_events::sensors;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flotilla_orchestrator::config::{Config, TopologyFile};
use flotilla_orchestrator::multigroup::{bucket_by_sensor, MultiGroup, RescanWorker};
use flotilla_orchestrator::simulated::SimulatedFactory;
use flotilla_orchestrator::tasks::TaskRunner;
use flotilla_orchestrator::topology::Deployment;
use flotilla_orchestrator::Services;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting flotilla orchestrator");

    let topology = match &config.topology_path {
        Some(path) => TopologyFile::from_path(path)?,
        None => {
            info!("No topology file configured, running demo topology");
            TopologyFile::demo()
        }
    };
    info!(
        clusters = topology.clusters.len(),
        fabrics = topology.fabrics.len(),
        rescan_interval_secs = config.rescan_interval_secs,
        "Configuration loaded"
    );

    let tasks = match config.task_timeout() {
        Some(timeout) => TaskRunner::with_timeout(timeout),
        None => TaskRunner::new(),
    };
    let services = Services::new().with_tasks(tasks);
    let members = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)));
    let deployment = Deployment::build(&topology, services.clone(), members)?;

    if let Err(e) = deployment.start().await {
        error!(error = %e, "Deployment started with failures");
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    for cluster in deployment.clusters() {
        let multigroup = MultiGroup::new(
            format!("{}-buckets", cluster.name()),
            services.clone(),
            cluster.clone(),
            bucket_by_sensor(Arc::clone(&services.bus), sensors::BUCKET),
        );
        multigroup.rescan_on_sensor(sensors::BUCKET);
        workers.push(RescanWorker::new(multigroup, config.rescan_interval()).spawn(shutdown_rx.clone()));
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Rescan worker panicked");
        }
    }

    if let Err(e) = deployment.stop().await {
        error!(error = %e, "Deployment stopped with failures");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
