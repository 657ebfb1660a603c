//! Identifier types used across the workspace.

use crate::define_id;

define_id!(
    /// A managed unit: a worker, or a cluster/fabric acting as one.
    UnitId,
    "unit"
);

define_id!(
    /// A placement target. Availability zones are locations too.
    LocationId,
    "loc"
);

define_id!(
    /// Handle returned by sensor-bus and group listener registration.
    SubscriptionId,
    "sub"
);
