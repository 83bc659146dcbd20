//! Simulate command implementation.

use super::wait_for_signal;
use crate::server::{start_server, ServerState};
use anyhow::Result;
use fleetpipe_core::health::HealthCheck;
use fleetpipe_core::kafka::{EventEmitter, KafkaEmitter, MemoryEmitter};
use fleetpipe_core::metrics::PipelineMetrics;
use fleetpipe_core::simulator::FleetSimulator;
use fleetpipe_core::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Options of the simulate command.
pub struct SimulateOptions {
    pub bootstrap_servers: Option<String>,
    pub devices: Option<usize>,
    pub seed: Option<u64>,
    pub duration: Option<Duration>,
    pub dry_run: bool,
}

/// Run the device fleet until a signal arrives or the duration elapses.
pub async fn run(mut config: Config, options: SimulateOptions) -> Result<()> {
    if let Some(servers) = options.bootstrap_servers {
        config.kafka.bootstrap_servers = servers.split(',').map(String::from).collect();
    }
    if let Some(devices) = options.devices {
        config.simulator.device_count = devices;
    }
    config.validate()?;

    let emitter: Arc<dyn EventEmitter> = if options.dry_run {
        warn!("Dry run: records are kept in memory and never reach the broker");
        Arc::new(MemoryEmitter::new(config.simulator.partitions_per_topic))
    } else {
        Arc::new(KafkaEmitter::new(&config.kafka)?)
    };

    let metrics = Arc::new(PipelineMetrics::new());
    let health = Arc::new(HealthCheck::new());

    let mut simulator = FleetSimulator::new(config.simulator.clone(), emitter)
        .with_metrics(Arc::clone(&metrics))
        .with_health(Arc::clone(&health));
    if let Some(seed) = options.seed {
        simulator = simulator.with_seed(seed);
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(start_server(
        Arc::new(ServerState {
            health,
            metrics: Arc::clone(&metrics),
        }),
        config.monitoring.health_port,
        config.monitoring.metrics_port,
        shutdown_tx.subscribe(),
    ));

    info!(
        devices = config.simulator.device_count,
        servers = %config.kafka.bootstrap_servers.join(","),
        "Starting device simulators"
    );
    simulator.start();

    match options.duration {
        Some(duration) => {
            tokio::select! {
                _ = wait_for_signal() => {}
                _ = tokio::time::sleep(duration) => {
                    info!(seconds = duration.as_secs(), "Simulation duration elapsed");
                }
            }
        }
        None => wait_for_signal().await,
    }

    let report = simulator.stop().await;
    let _ = shutdown_tx.send(());

    info!(
        emitted = metrics.records_emitted_total(),
        delivery_failures = metrics.delivery_failures_total(),
        drivers_aborted = report.drivers_aborted,
        undelivered = report.undelivered,
        "Simulation finished"
    );

    report.ensure_flushed()?;
    Ok(())
}
