//! Main ingestion engine orchestration.
//!
//! Integrates the consumer side of the pipeline:
//! - Multi-topic reader with manual offset commits
//! - Per-record decoding into micro-batches
//! - Fan-out writer for the cache, history and relational stores
//! - Batch retry with exponential backoff
//!
//! Offsets of a batch are committed only after its relational commit
//! succeeded, so a crash or a failed batch replays from the last good batch.

use crate::config::{Config, StoresConfig};
use crate::error::StoreError;
use crate::health::{Component, HealthCheck};
use crate::kafka::{KafkaMessage, MessageSource, MultiTopicReader, RetryConfig};
use crate::metrics::{PipelineMetrics, StoreKind};
use crate::store::{
    CacheStore, ColumnStore, HBaseColumnStore, MemoryCacheStore, MemoryColumnStore,
    MemoryRelationalStore, MySqlRelationalStore, RedisCacheStore, RelationalStore,
};
use crate::telemetry::Topic;
use crate::writer::{BatchFanOutWriter, BatchReport, MicroBatch, StoreFailures};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Upper bound for the engine to wind down after a shutdown signal.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// The three stores a batch fans out to.
#[derive(Clone)]
pub struct StoreHandles {
    pub cache: Arc<dyn CacheStore>,
    pub column: Arc<dyn ColumnStore>,
    pub relational: Arc<dyn RelationalStore>,
}

impl StoreHandles {
    /// Connect to Redis, the HBase gateway and MySQL.
    pub async fn connect(config: &StoresConfig) -> std::result::Result<Self, StoreError> {
        let cache = RedisCacheStore::new(&config.cache).await?;
        let column = HBaseColumnStore::new(&config.column).await?;
        let relational = MySqlRelationalStore::new(&config.relational).await?;

        Ok(Self {
            cache: Arc::new(cache),
            column: Arc::new(column),
            relational: Arc::new(relational),
        })
    }

    /// Empty in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            cache: Arc::new(MemoryCacheStore::new()),
            column: Arc::new(MemoryColumnStore::new()),
            relational: Arc::new(MemoryRelationalStore::new()),
        }
    }
}

/// Main ingestion engine.
pub struct IngestionEngine {
    config: Config,
    source: Arc<dyn MessageSource>,
    writer: BatchFanOutWriter,
    retry: RetryConfig,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthCheck>,
    shutdown_tx: broadcast::Sender<()>,
    next_batch_id: u64,
}

impl IngestionEngine {
    /// Create an engine reading from Kafka and writing to the real stores.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let source = Arc::new(MultiTopicReader::new(&config.kafka)?);
        let stores = StoreHandles::connect(&config.stores).await?;

        Ok(Self::with_components(config, source, stores))
    }

    /// Create an engine from explicit collaborators.
    pub fn with_components(
        config: Config,
        source: Arc<dyn MessageSource>,
        stores: StoreHandles,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());

        let health = Arc::new(HealthCheck::new());
        health.register_component(Component::Kafka);
        health.register_component(Component::Cache);
        health.register_component(Component::ColumnStore);
        health.register_component(Component::Relational);

        let writer = BatchFanOutWriter::new(
            stores.cache,
            stores.column,
            stores.relational,
            metrics.clone(),
        )
        .with_concurrency(config.writer.concurrency);

        let retry = RetryConfig::for_batches(&config.writer);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            source,
            writer,
            retry,
            metrics,
            health,
            shutdown_tx,
            next_batch_id: 1,
        }
    }

    /// Override the batch retry policy.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Ping every store and record the result in the health registry.
    ///
    /// Returns whether all stores answered.
    pub async fn check_stores(&self) -> bool {
        let (cache, column, relational) = tokio::join!(
            self.writer.cache().ping(),
            self.writer.column().ping(),
            self.writer.relational().ping()
        );

        let mut all_ok = true;
        for (component, result) in [
            (Component::Cache, cache),
            (Component::ColumnStore, column),
            (Component::Relational, relational),
        ] {
            match result {
                Ok(()) => self.health.mark_healthy(component),
                Err(e) => {
                    all_ok = false;
                    warn!(component = %component, error = %e, "Store health check failed");
                    self.health
                        .mark_unhealthy(component, &format!("Ping failed: {}", e));
                }
            }
        }
        all_ok
    }

    /// Run the main ingestion loop until a shutdown signal or until the
    /// pipeline becomes unhealthy.
    ///
    /// A batch that has been polled always runs to completion; the shutdown
    /// signal is only observed while waiting for messages.
    pub async fn run(&mut self) -> Result<()> {
        self.health.job_started();
        info!(
            topics = ?Topic::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            group = %self.config.kafka.consumer_group,
            batch_size = self.config.kafka.batch_size,
            "Ingestion engine started"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut outcome = Ok(());

        loop {
            let polled = tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }

                polled = self.poll() => polled,
            };

            let result = match polled {
                Ok(messages) if messages.is_empty() => continue,
                Ok(messages) => self.process_batch(&messages).await.map(|_| ()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                error!(error = %e, "Error processing batch");

                if !self.health.is_operational() {
                    error!("System unhealthy, stopping ingestion");
                    outcome = Err(e);
                    break;
                }
            }
        }

        self.health.job_completed();
        info!(
            batches = self.metrics.batches_total(),
            failed = self.metrics.batches_failed_total(),
            "Ingestion engine shut down complete"
        );
        outcome
    }

    /// Poll and process one batch. `None` when the poll came back empty.
    pub async fn step(&mut self) -> Result<Option<BatchReport>> {
        let messages = self.poll().await?;
        if messages.is_empty() {
            return Ok(None);
        }
        self.process_batch(&messages).await.map(Some)
    }

    async fn poll(&self) -> Result<Vec<KafkaMessage>> {
        let timeout = Duration::from_millis(self.config.kafka.batch_timeout_ms);
        match self
            .source
            .poll_batch(self.config.kafka.batch_size, timeout)
            .await
        {
            Ok(messages) => {
                self.health.mark_healthy(Component::Kafka);
                Ok(messages)
            }
            Err(e) => {
                self.health
                    .mark_unhealthy(Component::Kafka, &format!("Poll failed: {}", e));
                Err(e)
            }
        }
    }

    /// Decode, write and commit one batch of messages.
    pub async fn process_batch(&mut self, messages: &[KafkaMessage]) -> Result<BatchReport> {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        self.metrics.record_messages_consumed(messages.len() as u64);

        let batch = MicroBatch::from_messages(batch_id, messages);
        self.metrics.record_decode_failures(batch.decode_failures() as u64);
        debug!(
            batch_id,
            messages = batch.len(),
            malformed = batch.decode_failures(),
            "Micro-batch assembled"
        );

        let report = self.write_with_retry(&batch).await?;

        // Commit Kafka offsets only after a successful relational commit
        let offsets = batch.commit_offsets();
        if let Err(e) = self.source.commit_offsets(&offsets).await {
            self.health
                .mark_unhealthy(Component::Kafka, &format!("Offset commit failed: {}", e));
            return Err(e);
        }

        debug!(batch_id, partitions = offsets.len(), "Offsets committed");
        Ok(report)
    }

    async fn write_with_retry(&self, batch: &MicroBatch) -> Result<BatchReport> {
        let batch_id = batch.batch_id();
        let mut attempt = 0;

        loop {
            match self.writer.write_batch(batch).await {
                Ok(report) => {
                    self.record_store_failures(&report.store_failures);
                    return Ok(report);
                }
                Err(e) => {
                    attempt += 1;
                    let component = component_for(&e);

                    if attempt >= self.retry.max_retries {
                        self.metrics.record_batch_failed();
                        self.health.mark_unhealthy(
                            component,
                            &format!("Batch {} failed: {}", batch_id, e),
                        );
                        error!(
                            batch_id,
                            attempts = attempt,
                            error = %e,
                            "Batch failed after max retries, offsets not committed"
                        );
                        return Err(Error::Store(e));
                    }

                    self.metrics.record_batch_retry();
                    self.health.mark_degraded(component, &e.to_string());
                    let delay = self.retry.calculate_delay(attempt);
                    warn!(
                        batch_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Batch failed, retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Count the record failures of the committed attempt. Stores with
    /// failures become degraded, the others healthy.
    fn record_store_failures(&self, failures: &StoreFailures) {
        let stores = [
            (StoreKind::Cache, Component::Cache),
            (StoreKind::Column, Component::ColumnStore),
            (StoreKind::Relational, Component::Relational),
        ];

        for (store, component) in stores {
            let count = failures.get(store);
            self.metrics.record_store_failures(store, count as u64);
            if count > 0 {
                self.health.mark_degraded(
                    component,
                    &format!("{} record writes failed in last batch", count),
                );
            } else {
                self.health.mark_healthy(component);
            }
        }
    }

    /// Get metrics.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Get health check.
    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    /// Get shutdown signal sender.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Id the next batch will get.
    pub fn next_batch_id(&self) -> u64 {
        self.next_batch_id
    }
}

/// Health component a batch-level store error points at.
fn component_for(error: &StoreError) -> Component {
    match error {
        StoreError::Connection { store: "redis", .. } => Component::Cache,
        StoreError::Connection { store: "hbase", .. } => Component::ColumnStore,
        _ => Component::Relational,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::MemorySource;
    use crate::telemetry::{AlertRecord, AlertType, Severity, TelemetryRecord};

    fn alert(offset: i64) -> KafkaMessage {
        let record = TelemetryRecord::Alert(AlertRecord {
            device_id: "D0002".into(),
            alert_type: AlertType::ShockDetected,
            severity: Severity::Medium,
            timestamp: 1_717_200_000.0,
            detail: "Alert triggered by device D0002".into(),
        });
        KafkaMessage {
            key: Some(b"D0002".to_vec()),
            value: Some(record.to_payload().unwrap()),
            topic: "alerts".into(),
            partition: 3,
            offset,
            timestamp: 0,
            headers: Vec::new(),
        }
    }

    fn config() -> Config {
        let mut config = Config::with_bootstrap_servers(vec!["localhost:29092".into()]);
        config.kafka.batch_size = 2;
        config.kafka.batch_timeout_ms = 10;
        config
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), max_retries)
            .without_jitter()
    }

    #[tokio::test]
    async fn test_step_commits_after_write() {
        let source = Arc::new(MemorySource::from_messages(vec![alert(10), alert(11), alert(12)]));
        let relational = Arc::new(MemoryRelationalStore::new());
        let stores = StoreHandles {
            relational: relational.clone(),
            ..StoreHandles::in_memory()
        };
        let mut engine = IngestionEngine::with_components(config(), source.clone(), stores);

        let first = engine.step().await.unwrap().unwrap();
        assert_eq!(first.batch_id, 1);
        assert_eq!(first.relational_rows, 2);
        assert_eq!(source.committed("alerts", 3), Some(12));

        let second = engine.step().await.unwrap().unwrap();
        assert_eq!(second.batch_id, 2);
        assert_eq!(source.committed("alerts", 3), Some(13));
        assert_eq!(relational.alarms().len(), 3);

        assert!(engine.step().await.unwrap().is_none());
        assert_eq!(engine.metrics().messages_consumed_total(), 3);
    }

    #[tokio::test]
    async fn test_failed_batch_is_retried_then_not_committed() {
        let source = Arc::new(MemorySource::from_messages(vec![alert(0)]));
        let relational = Arc::new(MemoryRelationalStore::new());
        relational.fail_commits(true);
        let stores = StoreHandles {
            relational: relational.clone(),
            ..StoreHandles::in_memory()
        };
        let mut engine = IngestionEngine::with_components(config(), source.clone(), stores)
            .with_retry_config(fast_retry(3));

        let err = engine.step().await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Commit { batch_id: 1, .. })));
        assert_eq!(source.committed("alerts", 3), None);
        assert_eq!(engine.metrics().batch_retries_total(), 2);
        assert_eq!(engine.metrics().batches_failed_total(), 1);
        assert!(!engine.health().is_operational());
    }

    #[tokio::test]
    async fn test_retried_batch_counts_failures_once() {
        let malformed = KafkaMessage {
            key: Some(b"D0002".to_vec()),
            value: Some(b"not json".to_vec()),
            topic: "alerts".into(),
            partition: 3,
            offset: 1,
            timestamp: 0,
            headers: Vec::new(),
        };
        let source = Arc::new(MemorySource::from_messages(vec![alert(0), malformed]));
        let relational = Arc::new(MemoryRelationalStore::new());
        relational.fail_commits(true);
        relational.fail_on("D0002");
        let stores = StoreHandles {
            relational: relational.clone(),
            ..StoreHandles::in_memory()
        };
        let mut engine = IngestionEngine::with_components(config(), source, stores)
            .with_retry_config(fast_retry(3));

        assert!(engine.step().await.is_err());
        assert_eq!(engine.metrics().batch_retries_total(), 2);
        assert_eq!(engine.metrics().decode_failures_total(), 1);
        // No attempt committed, so no record failure is counted
        assert_eq!(engine.metrics().store_failures(StoreKind::Relational), 0);
    }

    #[tokio::test]
    async fn test_record_failures_degrade_store() {
        let source = Arc::new(MemorySource::from_messages(vec![alert(0), alert(1)]));
        let relational = Arc::new(MemoryRelationalStore::new());
        relational.fail_on("D0002");
        let stores = StoreHandles {
            relational: relational.clone(),
            ..StoreHandles::in_memory()
        };
        let mut engine = IngestionEngine::with_components(config(), source, stores);

        let report = engine.step().await.unwrap().unwrap();
        assert_eq!(report.store_failures.relational, 2);
        assert_eq!(engine.metrics().store_failures(StoreKind::Relational), 2);
        assert_eq!(engine.metrics().store_failures(StoreKind::Cache), 0);
        assert!(matches!(
            engine.health().get_component_status(Component::Relational),
            Some(crate::health::ComponentStatus::Degraded(_))
        ));
        assert_eq!(
            engine.health().get_component_status(Component::Cache),
            Some(crate::health::ComponentStatus::Healthy)
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let source = Arc::new(MemorySource::from_messages(vec![alert(0), alert(1)]));
        let mut engine =
            IngestionEngine::with_components(config(), source.clone(), StoreHandles::in_memory());
        let shutdown = engine.shutdown_signal();
        let health = engine.health().clone();

        let handle = tokio::spawn(async move { engine.run().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while source.committed("alerts", 3).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!health.is_job_running());
        assert_eq!(source.committed("alerts", 3), Some(2));
    }

    #[test]
    fn test_component_for_error() {
        let err = StoreError::Connection {
            store: "hbase",
            message: "refused".into(),
        };
        assert_eq!(component_for(&err), Component::ColumnStore);

        let err = StoreError::Commit {
            batch_id: 1,
            message: "deadlock".into(),
        };
        assert_eq!(component_for(&err), Component::Relational);
    }
}
