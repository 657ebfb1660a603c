//! Configuration for the orchestrator.
//!
//! Two layers: [`Config`] holds daemon settings read from the environment,
//! and [`TopologyFile`] describes the clusters and fabrics to run, loaded
//! from TOML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use flotilla_reconcile::DetectorConfig;
use serde::{Deserialize, Serialize};

// =============================================================================
// Daemon configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Topology file to load. Without one a single demo cluster runs.
    pub topology_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Interval between periodic multigroup rescans.
    pub rescan_interval_secs: u64,

    /// Upper bound on waiting for a batch of parallel tasks. 0 disables it.
    pub task_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let topology_path = std::env::var("FLOTILLA_TOPOLOGY").ok().map(PathBuf::from);

        let log_level =
            std::env::var("FLOTILLA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let rescan_interval_secs = std::env::var("FLOTILLA_RESCAN_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let task_timeout_secs = std::env::var("FLOTILLA_TASK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            topology_path,
            log_level,
            rescan_interval_secs,
            task_timeout_secs,
        })
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs.max(1))
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        match self.task_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

// =============================================================================
// Topology
// =============================================================================

/// Which member goes first when a cluster shrinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalStrategyName {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Zone failure detector thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSpec {
    pub window_secs: u64,
    pub min_failures: u32,
    pub max_failure_proportion: f64,
}

impl Default for DetectorSpec {
    fn default() -> Self {
        let config = DetectorConfig::default();
        Self {
            window_secs: config.window.as_secs(),
            min_failures: config.min_failures,
            max_failure_proportion: config.max_failure_proportion,
        }
    }
}

impl DetectorSpec {
    pub fn to_config(&self) -> DetectorConfig {
        DetectorConfig {
            window: Duration::from_secs(self.window_secs),
            min_failures: self.min_failures,
            max_failure_proportion: self.max_failure_proportion,
        }
    }
}

/// Declarative description of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    pub name: String,

    /// Location name the cluster is started at.
    pub location: Option<String>,

    pub initial_size: usize,

    /// Start succeeds once this many members are up. Defaults to all.
    pub initial_quorum_size: Option<usize>,

    /// Quorum check for `service.up`, e.g. `at_least_one_unless_empty`.
    pub up_quorum_check: String,

    /// Settings handed to the factory for every member.
    pub member_spec: serde_json::Map<String, serde_json::Value>,

    /// Settings for the first member instead of `member_spec`.
    pub first_member_spec: Option<serde_json::Map<String, serde_json::Value>>,

    pub removal_strategy: RemovalStrategyName,

    pub quarantine_failed_entities: bool,

    /// Quarantine only failures whose message contains this text.
    pub quarantine_filter: Option<String>,

    pub enable_availability_zones: bool,
    pub num_availability_zones: Option<usize>,
    pub availability_zone_names: Vec<String>,

    pub zone_failure_detector: DetectorSpec,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            name: "cluster".to_string(),
            location: None,
            initial_size: 1,
            initial_quorum_size: None,
            up_quorum_check: "at_least_one_unless_empty".to_string(),
            member_spec: serde_json::Map::new(),
            first_member_spec: None,
            removal_strategy: RemovalStrategyName::default(),
            quarantine_failed_entities: false,
            quarantine_filter: None,
            enable_availability_zones: false,
            num_availability_zones: None,
            availability_zone_names: Vec::new(),
            zone_failure_detector: DetectorSpec::default(),
        }
    }
}

/// Declarative description of a fabric of clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricSpec {
    pub name: String,

    /// Location names, one child cluster each.
    pub locations: Vec<String>,

    /// Template for each child cluster. Its name is suffixed per location.
    #[serde(default)]
    pub member: ClusterSpec,
}

/// Contents of a topology file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyFile {
    /// Availability zone names per location name.
    pub zones: BTreeMap<String, Vec<String>>,
    pub clusters: Vec<ClusterSpec>,
    pub fabrics: Vec<FabricSpec>,
}

impl TopologyFile {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid topology file")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read topology file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// A single three-member cluster at `local`.
    pub fn demo() -> Self {
        Self {
            zones: BTreeMap::from([(
                "local".to_string(),
                vec!["local-a".to_string(), "local-b".to_string()],
            )]),
            clusters: vec![ClusterSpec {
                name: "demo".to_string(),
                location: Some("local".to_string()),
                initial_size: 3,
                enable_availability_zones: true,
                num_availability_zones: Some(2),
                ..ClusterSpec::default()
            }],
            fabrics: Vec::new(),
        }
    }
}
