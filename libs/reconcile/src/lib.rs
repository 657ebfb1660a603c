//! Convergence helpers for resizable groups.
//!
//! Pure decision logic shared by the orchestrators. Nothing here performs
//! I/O or spawns tasks; callers feed in observed state and act on the
//! returned decision.
//!
//! - [`QuorumCheck`]: is an achieved size good enough for a target size?
//! - [`ZoneFailureDetector`]: should a failure domain be avoided for now?
//! - [`plan_placements`]: which zones should new units go to?
//! - [`newest_first`] / [`select_for_removal`]: which units go on shrink?
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs and clock readings
//! - Placement never returns an empty plan while zones exist, even when
//!   every zone is avoided

mod detector;
mod placement;
mod quorum;
mod removal;

pub use detector::{DetectorConfig, ZoneFailureDetector, ZoneStats};
pub use placement::plan_placements;
pub use quorum::{QuorumCheck, QuorumParseError};
pub use removal::{newest_first, oldest_first, select_for_removal};
