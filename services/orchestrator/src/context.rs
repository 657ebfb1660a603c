//! Shared services handed to every orchestrator.

use std::sync::Arc;

use flotilla_events::SensorBus;

use crate::registry::UnitRegistry;
use crate::tasks::TaskRunner;

/// Sensor bus, unit registry and task runner shared by the groups,
/// clusters and fabrics of one deployment.
#[derive(Debug, Clone)]
pub struct Services {
    pub bus: Arc<SensorBus>,
    pub registry: Arc<UnitRegistry>,
    pub tasks: TaskRunner,
}

impl Services {
    pub fn new() -> Self {
        let bus = Arc::new(SensorBus::new());
        let registry = Arc::new(UnitRegistry::new(Arc::clone(&bus)));
        Self {
            bus,
            registry,
            tasks: TaskRunner::new(),
        }
    }

    pub fn with_tasks(mut self, tasks: TaskRunner) -> Self {
        self.tasks = tasks;
        self
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}
