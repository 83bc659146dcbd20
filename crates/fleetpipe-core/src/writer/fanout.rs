//! Topic-routed fan-out of a micro-batch to the three stores.
//!
//! Location records go to the cache and the history store, logistics and
//! alert records go to the relational store inside one transaction per
//! batch. Every record is written on its own: a failed write is logged with
//! the batch id and record key and the batch carries on. Only failures that
//! concern the whole batch (no connection, failed commit) are returned.
//!
//! Cache and history writes are not undone when the relational commit
//! fails. Both are idempotent upserts, so replaying the batch is safe.

use super::batch::{BatchRecord, MicroBatch};
use crate::error::StoreError;
use crate::metrics::{PipelineMetrics, StoreKind};
use crate::store::{
    AlarmRow, CacheStore, ColumnStore, OrderRow, RelationalStore, RelationalTransaction,
    TrackingRow, VehicleState,
};
use crate::telemetry::{LocationRecord, TelemetryRecord};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default number of location records written concurrently.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Outcome of one batch that reached its relational commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_id: u64,
    /// Messages in the batch
    pub records: usize,
    /// Records whose every store write succeeded
    pub written: usize,
    pub decode_failures: usize,
    /// Individual store writes that failed
    pub store_failures: StoreFailures,
    /// Rows made durable by the relational commit
    pub relational_rows: usize,
    pub duration: Duration,
}

/// Per-store count of record writes that failed within one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreFailures {
    pub cache: usize,
    pub column: usize,
    pub relational: usize,
}

impl StoreFailures {
    pub fn total(&self) -> usize {
        self.cache + self.column + self.relational
    }

    /// Count of one store.
    pub fn get(&self, store: StoreKind) -> usize {
        match store {
            StoreKind::Cache => self.cache,
            StoreKind::Column => self.column,
            StoreKind::Relational => self.relational,
        }
    }

    fn add(&mut self, other: StoreFailures) {
        self.cache += other.cache;
        self.column += other.column;
        self.relational += other.relational;
    }
}

enum RelationalRow {
    Order(OrderRow),
    Alarm(AlarmRow),
}

/// Writes micro-batches to the cache, history and relational stores.
pub struct BatchFanOutWriter {
    cache: Arc<dyn CacheStore>,
    column: Arc<dyn ColumnStore>,
    relational: Arc<dyn RelationalStore>,
    metrics: Arc<PipelineMetrics>,
    concurrency: usize,
}

impl BatchFanOutWriter {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        column: Arc<dyn ColumnStore>,
        relational: Arc<dyn RelationalStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            cache,
            column,
            relational,
            metrics,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Bound the number of location records in flight.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn column(&self) -> &Arc<dyn ColumnStore> {
        &self.column
    }

    pub fn relational(&self) -> &Arc<dyn RelationalStore> {
        &self.relational
    }

    /// Write one micro-batch.
    ///
    /// Returns an error only when the batch as a whole failed: the relational
    /// store could not be prepared or reached, or the commit failed. The
    /// transaction is finished or dropped on every path.
    ///
    /// Decode and per-record store failures are reported, not recorded in
    /// the metrics: a retried batch would count them once per attempt.
    pub async fn write_batch(&self, batch: &MicroBatch) -> Result<BatchReport, StoreError> {
        let start = Instant::now();
        let batch_id = batch.batch_id();
        let mut report = BatchReport {
            batch_id,
            records: batch.len(),
            ..Default::default()
        };

        let mut locations: Vec<(&BatchRecord, &LocationRecord)> = Vec::new();
        let mut rows: Vec<(&BatchRecord, RelationalRow)> = Vec::new();

        for entry in batch.records() {
            let converted = match &entry.record {
                Err(e) => {
                    report.decode_failures += 1;
                    warn!(
                        batch_id,
                        topic = %entry.topic,
                        key = entry.key(),
                        partition = entry.partition,
                        offset = entry.offset,
                        error = %e,
                        "Skipping malformed record"
                    );
                    continue;
                }
                Ok(TelemetryRecord::Location(record)) => {
                    locations.push((entry, record));
                    continue;
                }
                Ok(TelemetryRecord::Logistics(record)) => {
                    OrderRow::from_logistics(record).map(RelationalRow::Order)
                }
                Ok(TelemetryRecord::Alert(record)) => {
                    AlarmRow::from_alert(record).map(RelationalRow::Alarm)
                }
            };

            match converted {
                Ok(row) => rows.push((entry, row)),
                Err(e) => {
                    report.store_failures.relational += 1;
                    error!(batch_id, topic = %entry.topic, key = entry.key(), error = %e, "Record rejected");
                }
            }
        }

        // DDL commits implicitly, so tables are created before the transaction
        let tables: BTreeSet<String> = rows
            .iter()
            .filter_map(|(_, row)| match row {
                RelationalRow::Order(order) => Some(order.table.clone()),
                RelationalRow::Alarm(_) => None,
            })
            .collect();
        let tables: Vec<String> = tables.into_iter().collect();
        self.relational.ensure_tables(&tables).await?;

        let mut tx = self.relational.begin().await?;

        let (location_failures, (relational_ok, relational_failures)) = tokio::join!(
            self.write_locations(batch_id, &locations),
            Self::insert_rows(batch_id, tx.as_mut(), &rows),
        );

        if let Err(e) = tx.commit().await {
            self.metrics.record_commit_failure();
            error!(
                batch_id,
                relational_rows = relational_ok,
                locations = locations.len(),
                error = %e,
                "Relational commit failed, batch rolled back"
            );
            return Err(StoreError::Commit {
                batch_id,
                message: e.to_string(),
            });
        }
        self.metrics.record_commit();

        let failed_locations = location_failures.iter().filter(|f| f.total() > 0).count();
        for failures in location_failures {
            report.store_failures.add(failures);
        }
        report.store_failures.relational += relational_failures;
        report.relational_rows = relational_ok;
        report.written = (locations.len() - failed_locations) + relational_ok;
        report.duration = start.elapsed();

        self.metrics.record_batch(report.written, report.duration);
        info!(
            batch_id,
            records = report.records,
            written = report.written,
            decode_failures = report.decode_failures,
            store_failures = report.store_failures.total(),
            duration_ms = %report.duration.as_millis(),
            "Batch written"
        );

        Ok(report)
    }

    /// Failed store writes of each location record.
    async fn write_locations(
        &self,
        batch_id: u64,
        locations: &[(&BatchRecord, &LocationRecord)],
    ) -> Vec<StoreFailures> {
        let writes: Vec<_> = locations
            .iter()
            .map(|(entry, record)| self.write_location(batch_id, entry, record))
            .collect();
        stream::iter(writes)
        .buffer_unordered(self.concurrency)
        .collect()
        .await
    }

    async fn write_location(
        &self,
        batch_id: u64,
        entry: &BatchRecord,
        record: &LocationRecord,
    ) -> StoreFailures {
        let state = VehicleState::from_location(record);
        let row = TrackingRow::from_location(record);

        let (cached, stored) = tokio::join!(
            self.cache.upsert_vehicle(&state),
            self.column.put_location(&row)
        );

        let mut failures = StoreFailures::default();
        if let Err(e) = cached {
            failures.cache += 1;
            error!(batch_id, topic = %entry.topic, key = entry.key(), vehicle_id = %record.vehicle_id, error = %e, "Cache write failed");
        }
        if let Err(e) = stored {
            failures.column += 1;
            error!(batch_id, topic = %entry.topic, key = entry.key(), row_key = %row.row_key(), error = %e, "History write failed");
        }
        if failures.total() == 0 {
            debug!(batch_id, vehicle_id = %record.vehicle_id, "Vehicle written to cache and history");
        }
        failures
    }

    /// Insert rows in order; returns (inserted, failed).
    async fn insert_rows(
        batch_id: u64,
        tx: &mut dyn RelationalTransaction,
        rows: &[(&BatchRecord, RelationalRow)],
    ) -> (usize, usize) {
        let mut inserted = 0;
        let mut failed = 0;

        for (entry, row) in rows {
            let result = match row {
                RelationalRow::Order(order) => tx.insert_order(order).await,
                RelationalRow::Alarm(alarm) => tx.insert_alarm(alarm).await,
            };

            match result {
                Ok(()) => inserted += 1,
                Err(e) => {
                    failed += 1;
                    error!(batch_id, topic = %entry.topic, key = entry.key(), error = %e, "Relational insert failed");
                }
            }
        }

        (inserted, failed)
    }
}
