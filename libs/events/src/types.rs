//! Well-known sensor names and their value types.

use serde::{Deserialize, Serialize};

/// Sensor names published by the orchestrator and by units.
pub mod sensors {
    /// `bool`: the unit considers itself serving.
    pub const SERVICE_UP: &str = "service.up";

    /// [`super::ServiceState`]: lifecycle phase of a unit.
    pub const SERVICE_STATE: &str = "service.state";

    /// `u64`: number of members of a group or cluster.
    pub const GROUP_SIZE: &str = "group.size";

    /// `u64`: sum of `group.size` across a fabric's children.
    pub const FABRIC_SIZE: &str = "fabric.size";

    /// `string`: id of the first member of a cluster.
    pub const CLUSTER_FIRST: &str = "cluster.first";

    /// [`super::ConvergenceState`]: how a cluster's size compares to its target.
    pub const CLUSTER_CONVERGENCE: &str = "cluster.convergence";

    /// `u64`: number of units held in a cluster's quarantine group.
    pub const QUARANTINE_SIZE: &str = "quarantine.size";

    /// `bool`: published once by the registry when a unit is unmanaged.
    pub const UNMANAGED: &str = "unit.unmanaged";

    /// `string`: bucket key used by the rebucketing group, by convention.
    pub const BUCKET: &str = "multigroup.bucket";
}

/// Lifecycle phase of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    OnFire,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Created => "created",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::OnFire => "on_fire",
        };
        write!(f, "{}", s)
    }
}

/// Published value of [`sensors::CLUSTER_CONVERGENCE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceState {
    Converged,
    Converging,
    Diverged,
}
