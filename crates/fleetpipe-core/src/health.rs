//! Health check system for monitoring component status.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Components whose health is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    /// Broker connectivity (producer or consumer)
    Kafka,
    /// Redis cache
    Cache,
    /// HBase history store
    ColumnStore,
    /// MySQL store
    Relational,
    /// Device drivers
    Simulator,
}

impl Component {
    /// Name used in health reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Kafka => "kafka",
            Component::Cache => "cache",
            Component::ColumnStore => "column_store",
            Component::Relational => "relational",
            Component::Simulator => "simulator",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component status is unknown
    Unknown,
}

/// Overall system health status.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// System is unhealthy
    Unhealthy,
}

/// Health check manager for tracking component health.
pub struct HealthCheck {
    components: RwLock<BTreeMap<Component, ComponentStatus>>,
    started_at: Instant,
    running: RwLock<bool>,
}

impl HealthCheck {
    /// Create a new health check manager.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(BTreeMap::new()),
            started_at: Instant::now(),
            running: RwLock::new(false),
        }
    }

    /// Register a component to track.
    pub fn register_component(&self, component: Component) {
        self.components
            .write()
            .insert(component, ComponentStatus::Unknown);
    }

    /// Mark a component as healthy.
    pub fn mark_healthy(&self, component: Component) {
        self.components
            .write()
            .insert(component, ComponentStatus::Healthy);
    }

    /// Mark a component as degraded.
    pub fn mark_degraded(&self, component: Component, reason: &str) {
        self.components
            .write()
            .insert(component, ComponentStatus::Degraded(reason.to_string()));
    }

    /// Mark a component as unhealthy.
    pub fn mark_unhealthy(&self, component: Component, reason: &str) {
        self.components
            .write()
            .insert(component, ComponentStatus::Unhealthy(reason.to_string()));
    }

    /// Get the status of a specific component.
    pub fn get_component_status(&self, component: Component) -> Option<ComponentStatus> {
        self.components.read().get(&component).cloned()
    }

    /// Get all component statuses.
    pub fn get_all_statuses(&self) -> BTreeMap<Component, ComponentStatus> {
        self.components.read().clone()
    }

    /// Get overall system health status.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Check if the system is operational (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Mark the simulator or ingestion loop as started.
    pub fn job_started(&self) {
        *self.running.write() = true;
    }

    /// Mark the simulator or ingestion loop as finished.
    pub fn job_completed(&self) {
        *self.running.write() = false;
    }

    /// Whether the main loop is running.
    pub fn is_job_running(&self) -> bool {
        *self.running.read()
    }

    /// Time since this health registry was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
