//! Flotilla orchestrator library
//!
//! Keeps groups of managed units at a target size: creating, starting,
//! stopping and replacing them, spreading them across availability zones
//! and steering away from zones that keep failing.
//!
//! ## Architecture
//!
//! ```text
//! Fabric                       (one child per location)
//! └── Cluster                  (resizable, zone-aware)
//!     ├── Group                (members + children, group.size)
//!     ├── QuarantineGroup      (units that failed to start)
//!     └── Unit*                (created by a UnitFactory)
//!
//! MultiGroup                   (rebuckets a source by a key function)
//! MembershipTracker            (listens to member sensor changes)
//! ```
//!
//! Every orchestrator shares one [`context::Services`]: the sensor bus the
//! units publish to, the registry of managed units and the task runner
//! used for parallel work.
//!
//! ## Modules
//!
//! - `cluster`: resizable cluster and zone-aware placement
//! - `fabric`: multi-location fan-out
//! - `group`: membership groups, trackers and quarantine
//! - `multigroup`: rebucketing groups and their rescan worker
//! - `topology`: deployments built from a topology file

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod fabric;
pub mod group;
pub mod location;
pub mod multigroup;
pub mod registry;
pub mod simulated;
pub mod tasks;
pub mod topology;
pub mod unit;

pub use cluster::{Cluster, ClusterBuilder};
pub use context::Services;
pub use error::{AggregateError, OrchestratorError, OrchestratorResult, UnitFailure};
pub use fabric::Fabric;
pub use group::{Group, MembershipTracker, QuarantineGroup};
pub use location::{LocationRef, ZoneProvider, ZoneSelection};
pub use multigroup::MultiGroup;
pub use unit::{MemberSet, Resizable, Startable, Unit, UnitFactory, UnitRef};
