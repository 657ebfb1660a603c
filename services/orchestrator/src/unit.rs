//! Unit abstraction and factory interface.
//!
//! A unit is an opaque managed resource that can be started at a set of
//! locations and stopped. How it comes up is the factory's business; the
//! orchestrator only drives its lifecycle and membership.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use flotilla_id::UnitId;

use crate::error::OrchestratorResult;
use crate::location::LocationRef;

/// Lifecycle operations of a managed unit.
#[async_trait]
pub trait Startable: Send + Sync {
    /// Bring the unit up at the given locations.
    async fn start(&self, locations: &[LocationRef]) -> Result<()>;

    /// Bring the unit down.
    async fn stop(&self) -> Result<()>;
}

/// A managed unit.
pub trait Unit: Startable {
    fn id(&self) -> UnitId;

    /// Monotonic creation order, used by removal strategies.
    fn creation_seq(&self) -> u64;

    /// Units that cannot be started are tolerated as group children but
    /// never counted as capacity.
    fn is_startable(&self) -> bool {
        true
    }

    /// Locations the unit was last started at.
    fn locations(&self) -> Vec<LocationRef> {
        Vec::new()
    }

    fn display_name(&self) -> String {
        self.id().to_string()
    }
}

pub type UnitRef = Arc<dyn Unit>;

static CREATION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Next value of the process-wide creation sequence.
pub fn next_creation_seq() -> u64 {
    CREATION_SEQ.fetch_add(1, Ordering::SeqCst)
}

/// Read access to a membership collection.
pub trait MemberSet: Send + Sync {
    /// Members ordered by creation.
    fn members(&self) -> Vec<UnitRef>;

    fn has_member(&self, id: UnitId) -> bool;

    fn current_size(&self) -> usize {
        self.members().len()
    }
}

/// Something whose membership can be driven to a desired size.
#[async_trait]
pub trait Resizable: Send + Sync {
    /// Returns the achieved size.
    async fn resize(&self, desired: usize) -> OrchestratorResult<usize>;
}

// =============================================================================
// Factory
// =============================================================================

/// Everything a factory needs to build one unit.
#[derive(Debug, Clone)]
pub struct PlacementContext {
    /// Group the unit is created for.
    pub owner: UnitId,

    /// Location the unit will be started at.
    pub location: LocationRef,

    /// Monotonic index within the owner, starting at 0.
    pub member_index: u64,

    /// Free-form settings from the owner's member spec.
    pub overrides: serde_json::Map<String, serde_json::Value>,
}

/// Creates units for a cluster or fabric.
#[async_trait]
pub trait UnitFactory: Send + Sync {
    async fn create(&self, ctx: &PlacementContext) -> Result<UnitRef>;
}

/// Factory backed by a synchronous closure.
pub struct FnFactory<F>(F);

#[async_trait]
impl<F> UnitFactory for FnFactory<F>
where
    F: Fn(&PlacementContext) -> Result<UnitRef> + Send + Sync,
{
    async fn create(&self, ctx: &PlacementContext) -> Result<UnitRef> {
        (self.0)(ctx)
    }
}

/// Wrap a closure as a shared [`UnitFactory`].
pub fn factory_fn<F>(f: F) -> Arc<dyn UnitFactory>
where
    F: Fn(&PlacementContext) -> Result<UnitRef> + Send + Sync + 'static,
{
    Arc::new(FnFactory(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_sequence_is_monotonic() {
        let a = next_creation_seq();
        let b = next_creation_seq();
        assert!(b > a);
    }
}
