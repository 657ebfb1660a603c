//! Builds a running deployment out of a [`TopologyFile`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::cluster::{Cluster, ClusterBuilder};
use crate::config::{ClusterSpec, TopologyFile};
use crate::context::Services;
use crate::error::{AggregateError, OrchestratorResult, UnitFailure};
use crate::fabric::Fabric;
use crate::location::{LocationRef, StaticZoneProvider, ZoneProvider};
use crate::unit::{PlacementContext, UnitFactory, UnitRef};

/// Location used by clusters that do not name one.
pub const DEFAULT_LOCATION: &str = "local";

/// Creates one [`Cluster`] per placement, named after its location.
///
/// Fabrics use this to run a cluster in every region.
pub struct ClusterFactory {
    spec: ClusterSpec,
    services: Services,
    members: Arc<dyn UnitFactory>,
    zone_provider: Option<Arc<dyn ZoneProvider>>,
}

impl ClusterFactory {
    pub fn new(spec: ClusterSpec, services: Services, members: Arc<dyn UnitFactory>) -> Self {
        Self {
            spec,
            services,
            members,
            zone_provider: None,
        }
    }

    pub fn zone_provider(mut self, provider: Arc<dyn ZoneProvider>) -> Self {
        self.zone_provider = Some(provider);
        self
    }
}

#[async_trait]
impl UnitFactory for ClusterFactory {
    async fn create(&self, ctx: &PlacementContext) -> Result<UnitRef> {
        let mut spec = self.spec.clone();
        spec.name = format!("{}-{}", self.spec.name, ctx.location.name);
        for (key, value) in &ctx.overrides {
            spec.member_spec.insert(key.clone(), value.clone());
        }

        let mut builder = ClusterBuilder::from_spec(&spec)?.factory(Arc::clone(&self.members));
        if let Some(provider) = &self.zone_provider {
            builder = builder.zone_provider(Arc::clone(provider));
        }
        let cluster = builder.build(self.services.clone())?;
        Ok(cluster as UnitRef)
    }
}

/// The clusters and fabrics described by one topology file.
pub struct Deployment {
    services: Services,
    clusters: Vec<(Arc<Cluster>, LocationRef)>,
    fabrics: Vec<(Arc<Fabric>, Vec<LocationRef>)>,
}

impl Deployment {
    /// Build every cluster and fabric. Nothing is started yet.
    pub fn build(
        topology: &TopologyFile,
        services: Services,
        members: Arc<dyn UnitFactory>,
    ) -> OrchestratorResult<Self> {
        let zones = Arc::new(StaticZoneProvider::new());
        for (parent, names) in &topology.zones {
            zones.set_zones(parent, names.iter().cloned());
        }
        let zones: Arc<dyn ZoneProvider> = zones;

        // Location ids must be stable so that restarts bind to the same place.
        let mut locations: HashMap<String, LocationRef> = HashMap::new();
        let mut location = |name: &str| {
            locations
                .entry(name.to_string())
                .or_insert_with(|| LocationRef::new(name))
                .clone()
        };

        let mut clusters = Vec::with_capacity(topology.clusters.len());
        for spec in &topology.clusters {
            let cluster = ClusterBuilder::from_spec(spec)?
                .factory(Arc::clone(&members))
                .zone_provider(Arc::clone(&zones))
                .build(services.clone())?;
            let at = location(spec.location.as_deref().unwrap_or(DEFAULT_LOCATION));
            clusters.push((cluster, at));
        }

        let mut fabrics = Vec::with_capacity(topology.fabrics.len());
        for spec in &topology.fabrics {
            let factory = ClusterFactory::new(spec.member.clone(), services.clone(), Arc::clone(&members))
                .zone_provider(Arc::clone(&zones));
            let fabric = Fabric::builder(spec.name.clone())
                .factory(Arc::new(factory))
                .build(services.clone())?;
            let at: Vec<LocationRef> = spec.locations.iter().map(|name| location(name)).collect();
            fabrics.push((fabric, at));
        }

        info!(
            clusters = clusters.len(),
            fabrics = fabrics.len(),
            "Deployment built"
        );
        Ok(Self {
            services,
            clusters,
            fabrics,
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.clusters.iter().map(|(c, _)| Arc::clone(c)).collect()
    }

    pub fn fabrics(&self) -> Vec<Arc<Fabric>> {
        self.fabrics.iter().map(|(f, _)| Arc::clone(f)).collect()
    }

    pub fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters
            .iter()
            .find(|(c, _)| c.name() == name)
            .map(|(c, _)| Arc::clone(c))
    }

    pub fn fabric(&self, name: &str) -> Option<Arc<Fabric>> {
        self.fabrics
            .iter()
            .find(|(f, _)| f.name() == name)
            .map(|(f, _)| Arc::clone(f))
    }

    /// Start everything in parallel. One failure does not stop the rest.
    #[instrument(skip(self))]
    pub async fn start(&self) -> OrchestratorResult<()> {
        let mut tasks = Vec::new();
        let mut ids = Vec::new();
        for (cluster, location) in &self.clusters {
            let cluster = Arc::clone(cluster);
            let location = location.clone();
            ids.push(cluster.id());
            tasks.push(Box::pin(async move { cluster.start(std::slice::from_ref(&location)).await })
                as futures_util::future::BoxFuture<'static, OrchestratorResult<()>>);
        }
        for (fabric, locations) in &self.fabrics {
            let fabric = Arc::clone(fabric);
            let locations = locations.clone();
            ids.push(fabric.id());
            tasks.push(Box::pin(async move { fabric.start(&locations).await }));
        }

        let results = self.services.tasks.run_parallel("deployment.start", tasks).await;
        self.finish("start", ids, results)
    }

    /// Stop everything in parallel.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> OrchestratorResult<()> {
        let mut tasks = Vec::new();
        let mut ids = Vec::new();
        for (cluster, _) in &self.clusters {
            let cluster = Arc::clone(cluster);
            ids.push(cluster.id());
            tasks.push(Box::pin(async move { cluster.stop().await })
                as futures_util::future::BoxFuture<'static, OrchestratorResult<()>>);
        }
        for (fabric, _) in &self.fabrics {
            let fabric = Arc::clone(fabric);
            ids.push(fabric.id());
            tasks.push(Box::pin(async move { fabric.stop().await }));
        }

        let results = self.services.tasks.run_parallel("deployment.stop", tasks).await;
        self.finish("stop", ids, results)
    }

    fn finish(
        &self,
        action: &str,
        ids: Vec<flotilla_id::UnitId>,
        results: Vec<OrchestratorResult<()>>,
    ) -> OrchestratorResult<()> {
        let failures: Vec<UnitFailure> = ids
            .into_iter()
            .zip(results)
            .filter_map(|(id, result)| {
                result.err().map(|e| {
                    warn!(unit_id = %id, action, error = %e, "Deployment step failed");
                    UnitFailure::new(Some(id), None, e.into())
                })
            })
            .collect();
        match AggregateError::from_failures(failures) {
            Some(agg) => Err(agg.into()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("clusters", &self.clusters.len())
            .field("fabrics", &self.fabrics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedFactory;
    use crate::unit::MemberSet;

    const TOPOLOGY: &str = r#"
        [zones]
        us-east = ["us-east-a", "us-east-b"]

        [[clusters]]
        name = "web"
        location = "us-east"
        initial_size = 4
        enable_availability_zones = true

        [[fabrics]]
        name = "edge"
        locations = ["us-east", "eu-west"]

        [fabrics.member]
        name = "edge"
        initial_size = 2
    "#;

    #[tokio::test]
    async fn builds_and_runs_topology() {
        let topology = TopologyFile::from_toml_str(TOPOLOGY).unwrap();
        let services = Services::new();
        let members = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)));
        let deployment = Deployment::build(&topology, services.clone(), members).unwrap();

        deployment.start().await.unwrap();

        let web = deployment.cluster("web").unwrap();
        assert_eq!(web.current_size(), 4);
        assert_eq!(web.members_in_zone("us-east-a"), 2);
        assert_eq!(web.members_in_zone("us-east-b"), 2);

        let edge = deployment.fabric("edge").unwrap();
        assert_eq!(edge.current_size(), 2);
        assert_eq!(edge.size(), 4);

        deployment.stop().await.unwrap();
        assert_eq!(web.current_size(), 0);
        assert_eq!(edge.size(), 0);
    }

    #[tokio::test]
    async fn cluster_factory_names_children_by_location() {
        let services = Services::new();
        let members = Arc::new(SimulatedFactory::new(Arc::clone(&services.bus)));
        let factory = ClusterFactory::new(
            ClusterSpec {
                name: "db".to_string(),
                ..ClusterSpec::default()
            },
            services.clone(),
            members,
        );
        let ctx = PlacementContext {
            owner: flotilla_id::UnitId::new(),
            location: LocationRef::new("eu-west"),
            member_index: 0,
            overrides: serde_json::Map::new(),
        };

        let unit = factory.create(&ctx).await.unwrap();
        assert_eq!(unit.display_name(), "db-eu-west");
        assert!(services.registry.is_managed(unit.id()));
    }
}
