//! Fleet-wide simulator: one driver per registered device.

use crate::config::SimulatorConfig;
use crate::error::KafkaError;
use crate::health::{Component, HealthCheck};
use crate::kafka::EventEmitter;
use crate::metrics::PipelineMetrics;
use crate::simulator::{DeviceDriver, DeviceRegistry, StopOutcome};
use crate::telemetry::TelemetryGenerator;
use std::sync::Arc;
use tracing::{info, warn};

/// Summary of a simulator shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Drivers that stopped cleanly
    pub drivers_joined: usize,
    /// Drivers aborted after overrunning the stop timeout
    pub drivers_aborted: usize,
    /// Messages discarded by the final flush
    pub undelivered: usize,
}

impl ShutdownReport {
    /// Error if the final flush left messages behind.
    pub fn ensure_flushed(&self) -> Result<(), KafkaError> {
        if self.undelivered == 0 {
            Ok(())
        } else {
            Err(KafkaError::FlushIncomplete {
                pending: self.undelivered,
            })
        }
    }
}

/// Runs every device of the registry against one shared emitter.
pub struct FleetSimulator {
    config: SimulatorConfig,
    registry: Arc<DeviceRegistry>,
    emitter: Arc<dyn EventEmitter>,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthCheck>,
    drivers: Vec<DeviceDriver>,
    seed: Option<u64>,
}

impl FleetSimulator {
    /// Register the configured devices.
    pub fn new(config: SimulatorConfig, emitter: Arc<dyn EventEmitter>) -> Self {
        let registry = Arc::new(DeviceRegistry::register(
            config.device_count,
            config.base_latitude,
            config.base_longitude,
        ));

        let health = Arc::new(HealthCheck::new());
        health.register_component(Component::Simulator);
        health.register_component(Component::Kafka);

        Self {
            config,
            registry,
            emitter,
            metrics: Arc::new(PipelineMetrics::new()),
            health,
            drivers: Vec::new(),
            seed: None,
        }
    }

    /// Share metrics with the HTTP server.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share health state with the HTTP server.
    pub fn with_health(mut self, health: Arc<HealthCheck>) -> Self {
        health.register_component(Component::Simulator);
        health.register_component(Component::Kafka);
        self.health = health;
        self
    }

    /// Seed every driver deterministically (device `i` gets `seed + i`).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Start one driver per device.
    pub fn start(&mut self) {
        if !self.drivers.is_empty() {
            warn!("Simulator already started");
            return;
        }

        let generator = TelemetryGenerator::new(self.registry.clone());
        for (i, device_id) in self.registry.device_ids().enumerate() {
            let mut driver = DeviceDriver::new(
                device_id,
                generator.clone(),
                self.emitter.clone(),
                self.metrics.clone(),
                &self.config,
            );
            if let Some(seed) = self.seed {
                driver = driver.with_seed(seed.wrapping_add(i as u64));
            }
            driver.start();
            self.drivers.push(driver);
        }

        self.health.job_started();
        self.health.mark_healthy(Component::Simulator);
        info!(
            devices = self.drivers.len(),
            interval_ms = self.config.sleep_interval_ms,
            "All device simulators started"
        );
    }

    /// Stop all drivers concurrently, then flush the emitter.
    pub async fn stop(&mut self) -> ShutdownReport {
        let timeout = self.config.stop_timeout();
        let outcomes =
            futures::future::join_all(self.drivers.iter_mut().map(|d| d.stop(timeout))).await;

        let mut report = ShutdownReport::default();
        for outcome in outcomes {
            match outcome {
                StopOutcome::Joined => report.drivers_joined += 1,
                StopOutcome::Aborted => report.drivers_aborted += 1,
                StopOutcome::NotRunning => {}
            }
        }

        let flush = self.emitter.flush(self.config.flush_timeout()).await;
        report.undelivered = flush.undelivered;

        if flush.is_complete() {
            self.health.mark_healthy(Component::Kafka);
        } else {
            self.metrics
                .record_delivery_failures(flush.undelivered as u64);
            self.health.mark_degraded(
                Component::Kafka,
                &format!("{} messages undelivered at shutdown", flush.undelivered),
            );
            warn!(
                undelivered = flush.undelivered,
                timeout_ms = self.config.flush_timeout_ms,
                "Flush timed out, undelivered messages discarded"
            );
        }

        self.health.mark_degraded(Component::Simulator, "stopped");
        self.health.job_completed();
        info!(
            joined = report.drivers_joined,
            aborted = report.drivers_aborted,
            "All device simulators stopped"
        );

        report
    }

    /// Device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Shared health state.
    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    /// Drivers created by `start`.
    pub fn drivers(&self) -> &[DeviceDriver] {
        &self.drivers
    }
}
