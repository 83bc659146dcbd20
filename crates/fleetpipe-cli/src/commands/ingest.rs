//! Ingest command implementation.

use super::wait_for_signal;
use crate::server::{start_server, ServerState};
use anyhow::{bail, Result};
use fleetpipe_core::engine::{IngestionEngine, StoreHandles, SHUTDOWN_TIMEOUT};
use fleetpipe_core::kafka::MultiTopicReader;
use fleetpipe_core::Config;
use std::sync::Arc;
use tracing::{info, warn};

/// Run the ingestion engine.
pub async fn run(
    mut config: Config,
    bootstrap_servers: Option<String>,
    consumer_group: Option<String>,
    dry_run: bool,
) -> Result<()> {
    // Apply CLI overrides
    if let Some(servers) = bootstrap_servers {
        config.kafka.bootstrap_servers = servers.split(',').map(String::from).collect();
    }
    if let Some(g) = consumer_group {
        config.kafka.consumer_group = g;
    }

    info!(
        servers = %config.kafka.bootstrap_servers.join(","),
        group = %config.kafka.consumer_group,
        dry_run,
        "Starting ingestion engine"
    );

    let health_port = config.monitoring.health_port;
    let metrics_port = config.monitoring.metrics_port;

    let mut engine = if dry_run {
        config.validate()?;
        warn!("Dry run: records are written to in-memory stores and discarded on exit");
        let reader = Arc::new(MultiTopicReader::new(&config.kafka)?);
        IngestionEngine::with_components(config, reader, StoreHandles::in_memory())
    } else {
        IngestionEngine::new(config).await?
    };
    engine.check_stores().await;

    let shutdown_tx = engine.shutdown_signal();
    let server_state = Arc::new(ServerState {
        health: Arc::clone(engine.health()),
        metrics: Arc::clone(engine.metrics()),
    });

    // Start HTTP servers
    tokio::spawn(start_server(
        server_state,
        health_port,
        metrics_port,
        shutdown_tx.subscribe(),
    ));

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = signal_tx.send(());
    });

    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut running = tokio::spawn(async move { engine.run().await });

    let outcome = tokio::select! {
        joined = &mut running => joined?,
        _ = shutdown_rx.recv() => {
            // The engine finishes its current batch before it stops
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut running).await {
                Ok(joined) => joined?,
                Err(_) => {
                    running.abort();
                    bail!("Shutdown timeout exceeded ({}s), batch abandoned", SHUTDOWN_TIMEOUT.as_secs());
                }
            }
        }
    };

    // Stop the HTTP servers if the engine stopped on its own
    let _ = shutdown_tx.send(());
    outcome?;

    info!("Ingestion engine stopped");
    Ok(())
}
