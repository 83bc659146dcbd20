//! Per-device driver loop.
//!
//! `Idle -> Running -> Stopping -> Stopped`. A running driver ticks on a
//! fixed cadence; each tick rolls three independent probabilities and emits
//! zero to three records. Delivery handles are reaped between ticks and
//! drained on stop.

use crate::config::{EmissionProbabilities, SimulatorConfig};
use crate::error::KafkaError;
use crate::kafka::{Delivery, DeliveryHandle, EventEmitter};
use crate::metrics::PipelineMetrics;
use crate::telemetry::{TelemetryGenerator, Topic};
use futures::stream::{FuturesUnordered, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Extra time granted to the task after its drain deadline before it is aborted.
const JOIN_GRACE: Duration = Duration::from_millis(100);

/// Lifecycle of a device driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The loop finished its tick and drained deliveries in time.
    Joined,
    /// The loop overran the timeout and was aborted.
    Aborted,
    /// The driver was not running.
    NotRunning,
}

struct DriverContext {
    device_id: String,
    generator: TelemetryGenerator,
    emitter: Arc<dyn EventEmitter>,
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
    probabilities: EmissionProbabilities,
}

impl DriverContext {
    fn tick<R: Rng>(&self, rng: &mut R, in_flight: &mut FuturesUnordered<DeliveryHandle>) {
        let rolls = [
            (Topic::Logistics, self.probabilities.logistics),
            (Topic::Location, self.probabilities.location),
            (Topic::Alerts, self.probabilities.alert),
        ];

        for (topic, probability) in rolls {
            if rng.gen::<f64>() >= probability {
                continue;
            }

            match self.emit(topic, rng) {
                Ok(handle) => {
                    self.metrics.record_emitted(topic);
                    in_flight.push(handle);
                }
                Err(e) => {
                    self.metrics.record_tick_error();
                    error!(
                        device_id = %self.device_id,
                        topic = %topic,
                        error = %e,
                        "Failed to emit record"
                    );
                }
            }
        }
    }

    fn emit<R: Rng>(&self, topic: Topic, rng: &mut R) -> crate::Result<DeliveryHandle> {
        let record = self.generator.generate(topic, &self.device_id, rng)?;
        self.emitter.emit(topic, &self.device_id, &record)
    }

    fn report(&self, result: Result<Delivery, KafkaError>) {
        match result {
            Ok(delivery) => debug!(
                device_id = %self.device_id,
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                "Message delivered"
            ),
            Err(e) => {
                self.metrics.record_delivery_failure();
                error!(device_id = %self.device_id, error = %e, "Message delivery failed");
            }
        }
    }

    async fn run(self, mut stop_rx: watch::Receiver<Option<Instant>>, mut rng: StdRng) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: FuturesUnordered<DeliveryHandle> = FuturesUnordered::new();

        info!(device_id = %self.device_id, "Device driver started");

        let deadline = loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    // A dropped sender means the owner is gone; stop right away.
                    let requested = if changed.is_ok() { *stop_rx.borrow() } else { Some(Instant::now()) };
                    if let Some(deadline) = requested {
                        break deadline;
                    }
                }
                Some(result) = in_flight.next(), if !in_flight.is_empty() => self.report(result),
                _ = ticker.tick() => self.tick(&mut rng, &mut in_flight),
            }
        };

        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(result) = in_flight.next().await {
                self.report(result);
            }
        })
        .await;

        if drained.is_err() {
            let pending = in_flight.len();
            self.metrics.record_delivery_failures(pending as u64);
            warn!(
                device_id = %self.device_id,
                pending,
                "Stop timeout reached with unacknowledged deliveries"
            );
        }

        info!(device_id = %self.device_id, "Device driver stopped");
    }
}

/// Concurrent driver for one device.
pub struct DeviceDriver {
    device_id: String,
    state: DriverState,
    context: Option<DriverContext>,
    rng: Option<StdRng>,
    stop_tx: Option<watch::Sender<Option<Instant>>>,
    task: Option<JoinHandle<()>>,
    metrics: Arc<PipelineMetrics>,
}

impl DeviceDriver {
    /// Create an idle driver.
    pub fn new(
        device_id: impl Into<String>,
        generator: TelemetryGenerator,
        emitter: Arc<dyn EventEmitter>,
        metrics: Arc<PipelineMetrics>,
        config: &SimulatorConfig,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            context: Some(DriverContext {
                device_id: device_id.clone(),
                generator,
                emitter,
                metrics: metrics.clone(),
                interval: config.sleep_interval(),
                probabilities: config.probabilities,
            }),
            device_id,
            state: DriverState::Idle,
            rng: None,
            stop_tx: None,
            task: None,
            metrics,
        }
    }

    /// Use a deterministic random source.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Device this driver owns.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Spawn the loop. Only an idle driver can start.
    pub fn start(&mut self) -> bool {
        let Some(context) = self.context.take() else {
            warn!(device_id = %self.device_id, state = ?self.state, "Driver cannot be restarted");
            return false;
        };

        let rng = self.rng.take().unwrap_or_else(StdRng::from_entropy);
        let (stop_tx, stop_rx) = watch::channel(None);

        self.task = Some(tokio::spawn(context.run(stop_rx, rng)));
        self.stop_tx = Some(stop_tx);
        self.state = DriverState::Running;
        self.metrics.driver_started();
        true
    }

    /// Ask the loop to finish its current tick, drain deliveries and exit.
    ///
    /// Waits at most `timeout` (plus a short grace) before aborting the task.
    pub async fn stop(&mut self, timeout: Duration) -> StopOutcome {
        let Some(task) = self.task.take() else {
            if self.state == DriverState::Idle {
                self.context = None;
                self.state = DriverState::Stopped;
            }
            return StopOutcome::NotRunning;
        };

        self.state = DriverState::Stopping;
        let deadline = Instant::now() + timeout;
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(Some(deadline));
        }

        let abort = task.abort_handle();
        let outcome = match tokio::time::timeout_at(deadline + JOIN_GRACE, task).await {
            Ok(Ok(())) => StopOutcome::Joined,
            Ok(Err(e)) => {
                error!(device_id = %self.device_id, error = %e, "Device driver task failed");
                StopOutcome::Aborted
            }
            Err(_) => {
                abort.abort();
                warn!(device_id = %self.device_id, "Device driver did not stop in time, aborted");
                StopOutcome::Aborted
            }
        };

        self.state = DriverState::Stopped;
        self.metrics.driver_stopped();
        outcome
    }
}

impl Drop for DeviceDriver {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::MemoryEmitter;
    use crate::simulator::DeviceRegistry;
    use crate::telemetry::{decode, TelemetryRecord};

    fn fast_config(probabilities: EmissionProbabilities) -> SimulatorConfig {
        SimulatorConfig {
            sleep_interval_ms: 5,
            probabilities,
            ..SimulatorConfig::default()
        }
    }

    fn driver(
        emitter: Arc<MemoryEmitter>,
        metrics: Arc<PipelineMetrics>,
        config: &SimulatorConfig,
    ) -> DeviceDriver {
        let registry = Arc::new(DeviceRegistry::register(1, 30.0, 120.0));
        DeviceDriver::new(
            "D0000",
            TelemetryGenerator::new(registry),
            emitter,
            metrics,
            config,
        )
        .with_seed(17)
    }

    #[tokio::test]
    async fn test_driver_lifecycle() {
        let emitter = Arc::new(MemoryEmitter::new(8));
        let metrics = Arc::new(PipelineMetrics::new());
        let config = fast_config(EmissionProbabilities {
            logistics: 1.0,
            location: 1.0,
            alert: 1.0,
        });
        let mut driver = driver(emitter.clone(), metrics.clone(), &config);

        assert_eq!(driver.state(), DriverState::Idle);
        assert!(driver.start());
        assert_eq!(driver.state(), DriverState::Running);
        assert_eq!(metrics.active_drivers(), 1);
        assert!(!driver.start());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let outcome = driver.stop(Duration::from_secs(2)).await;

        assert_eq!(outcome, StopOutcome::Joined);
        assert_eq!(driver.state(), DriverState::Stopped);
        assert_eq!(metrics.active_drivers(), 0);

        let ticks = emitter.messages_for(Topic::Logistics).len();
        assert!(ticks >= 1);
        assert_eq!(emitter.messages_for(Topic::Location).len(), ticks);
        assert_eq!(emitter.messages_for(Topic::Alerts).len(), ticks);
        assert_eq!(metrics.records_emitted_total(), emitter.len() as u64);

        // No emissions after stop
        let count = emitter.len();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(emitter.len(), count);
    }

    #[tokio::test]
    async fn test_zero_probabilities_emit_nothing() {
        let emitter = Arc::new(MemoryEmitter::new(8));
        let metrics = Arc::new(PipelineMetrics::new());
        let config = fast_config(EmissionProbabilities {
            logistics: 0.0,
            location: 0.0,
            alert: 0.0,
        });
        let mut driver = driver(emitter.clone(), metrics, &config);

        driver.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        driver.stop(Duration::from_secs(1)).await;
        assert!(emitter.is_empty());
    }

    #[tokio::test]
    async fn test_driver_survives_emit_errors() {
        let emitter = Arc::new(MemoryEmitter::new(8));
        let metrics = Arc::new(PipelineMetrics::new());
        let config = fast_config(EmissionProbabilities {
            logistics: 0.0,
            location: 1.0,
            alert: 0.0,
        });
        let mut driver = driver(emitter.clone(), metrics.clone(), &config);

        emitter.reject_enqueue(true);
        driver.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(metrics.tick_errors_total() >= 1);

        emitter.reject_enqueue(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        driver.stop(Duration::from_secs(1)).await;

        let locations = emitter.messages_for(Topic::Location);
        assert!(!locations.is_empty());

        // Latitude keeps growing across emissions
        let mut previous = 0.0;
        for message in locations {
            let record = decode("vehicle-location", message.value.as_deref().unwrap()).unwrap();
            let TelemetryRecord::Location(location) = record else {
                panic!("expected a location record");
            };
            assert!(location.latitude >= previous);
            previous = location.latitude;
        }
    }

    #[tokio::test]
    async fn test_delivery_failures_are_counted() {
        let emitter = Arc::new(MemoryEmitter::new(8));
        let metrics = Arc::new(PipelineMetrics::new());
        let config = fast_config(EmissionProbabilities {
            logistics: 1.0,
            location: 0.0,
            alert: 0.0,
        });
        let mut driver = driver(emitter.clone(), metrics.clone(), &config);

        emitter.fail_deliveries(true);
        driver.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        driver.stop(Duration::from_secs(1)).await;

        assert!(metrics.delivery_failures_total() >= 1);
        assert_eq!(
            metrics.delivery_failures_total(),
            metrics.records_emitted(Topic::Logistics)
        );
    }

    #[tokio::test]
    async fn test_stop_idle_driver() {
        let emitter = Arc::new(MemoryEmitter::new(8));
        let metrics = Arc::new(PipelineMetrics::new());
        let mut driver = driver(emitter, metrics, &SimulatorConfig::default());

        assert_eq!(
            driver.stop(Duration::from_millis(10)).await,
            StopOutcome::NotRunning
        );
        assert_eq!(driver.state(), DriverState::Stopped);
        assert!(!driver.start());
    }
}
