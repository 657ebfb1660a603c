//! Locations, availability zones and zone selection.

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use flotilla_id::LocationId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{OrchestratorError, OrchestratorResult};

/// A place units can be started at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationRef {
    pub id: LocationId,
    pub name: String,

    /// Enclosing location for availability zones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<LocationId>,
}

impl LocationRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: LocationId::new(),
            name: name.into(),
            parent: None,
        }
    }

    /// A zone nested in `parent`.
    pub fn child_of(parent: &LocationRef, name: impl Into<String>) -> Self {
        Self {
            id: LocationId::new(),
            name: name.into(),
            parent: Some(parent.id),
        }
    }
}

impl fmt::Display for LocationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resolves the availability zones inside a location.
///
/// Implementations may call out to an external inventory.
#[async_trait]
pub trait ZoneProvider: Send + Sync {
    async fn sub_locations(&self, parent: &LocationRef) -> Result<Vec<LocationRef>>;
}

/// How a cluster picks zones out of the provider's list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneSelection {
    /// First `n` zones in provider order.
    Count(usize),

    /// Zones with exactly these names.
    Names(Vec<String>),
}

impl ZoneSelection {
    pub fn apply(&self, available: Vec<LocationRef>) -> OrchestratorResult<Vec<LocationRef>> {
        match self {
            ZoneSelection::Count(n) => select_by_count(available, *n),
            ZoneSelection::Names(names) => select_by_names(available, names),
        }
    }
}

/// Take the first `count` zones. Fewer available zones is tolerated.
pub fn select_by_count(available: Vec<LocationRef>, count: usize) -> OrchestratorResult<Vec<LocationRef>> {
    if count == 0 {
        return Err(OrchestratorError::Configuration(
            "zone count must be at least 1".to_string(),
        ));
    }
    if available.is_empty() {
        return Err(OrchestratorError::Configuration(
            "no availability zones available".to_string(),
        ));
    }
    if available.len() < count {
        warn!(
            requested = count,
            available = available.len(),
            "Fewer availability zones than requested, using all"
        );
    }
    Ok(available.into_iter().take(count).collect())
}

/// Pick zones by name, in the order given. Every name must exist.
pub fn select_by_names(available: Vec<LocationRef>, names: &[String]) -> OrchestratorResult<Vec<LocationRef>> {
    if names.is_empty() {
        return Err(OrchestratorError::Configuration(
            "availability zone name list is empty".to_string(),
        ));
    }
    names
        .iter()
        .map(|name| {
            available
                .iter()
                .find(|z| &z.name == name)
                .cloned()
                .ok_or_else(|| {
                    OrchestratorError::Configuration(format!("unknown availability zone '{}'", name))
                })
        })
        .collect()
}

/// In-memory zone inventory keyed by parent location name.
#[derive(Debug, Default)]
pub struct StaticZoneProvider {
    zones: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticZoneProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zones<I, S>(self, parent: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_zones(parent, names);
        self
    }

    pub fn set_zones<I, S>(&self, parent: &str, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.zones
            .write()
            .insert(parent.to_string(), names.into_iter().map(Into::into).collect());
    }
}

#[async_trait]
impl ZoneProvider for StaticZoneProvider {
    async fn sub_locations(&self, parent: &LocationRef) -> Result<Vec<LocationRef>> {
        let names = self
            .zones
            .read()
            .get(&parent.name)
            .cloned()
            .unwrap_or_default();
        Ok(names
            .into_iter()
            .map(|name| LocationRef::child_of(parent, name))
            .collect())
    }
}
