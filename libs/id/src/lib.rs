//! # flotilla-id
//!
//! Typed identifiers for the orchestration engine.
//!
//! Every identifier renders as `{prefix}_{ulid}`:
//!
//! - `unit_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a managed unit (clusters and
//!   fabrics are units too)
//! - `loc_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a location or availability zone
//! - `sub_01HV4Z4NYPLTRS0JTUA8XDME5F` for a sensor or group subscription
//!
//! ULIDs sort by creation time, which keeps logs and ordered maps readable,
//! but creation order of units is tracked separately by a sequence number
//! because two ULIDs minted in the same millisecond are not ordered.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;

/// Split `{prefix}_{ulid}` and check the prefix. Used by [`define_id!`].
#[doc(hidden)]
pub fn parse_prefixed(s: &str, prefix: &'static str) -> Result<Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let (actual, body) = s.split_once('_').ok_or(IdError::MissingSeparator)?;
    if actual != prefix {
        return Err(IdError::InvalidPrefix {
            expected: prefix,
            actual: actual.to_string(),
        });
    }

    body.parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}
