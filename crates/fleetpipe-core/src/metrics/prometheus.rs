//! Prometheus metrics export.

use crate::telemetry::Topic;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds for batch write duration.
/// Converts to seconds: [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
const BATCH_DURATION_BUCKETS_MS: [u64; 8] = [50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// Backing store label for per-store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Key-value cache (Redis)
    Cache,
    /// Wide-column history store (HBase)
    Column,
    /// Relational store (MySQL)
    Relational,
}

impl StoreKind {
    /// All store kinds, in export order.
    pub const ALL: [StoreKind; 3] = [StoreKind::Cache, StoreKind::Column, StoreKind::Relational];

    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreKind::Cache => "cache",
            StoreKind::Column => "column",
            StoreKind::Relational => "relational",
        }
    }

    fn index(&self) -> usize {
        match self {
            StoreKind::Cache => 0,
            StoreKind::Column => 1,
            StoreKind::Relational => 2,
        }
    }
}

fn topic_index(topic: Topic) -> usize {
    match topic {
        Topic::Logistics => 0,
        Topic::Location => 1,
        Topic::Alerts => 2,
    }
}

/// Simulator and writer metrics with counters, gauges, and a histogram.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // === SIMULATOR ===
    /// Records handed to the emitter, by topic
    records_emitted: [AtomicU64; 3],
    /// Records the broker rejected or never acknowledged
    delivery_failures_total: AtomicU64,
    /// Driver ticks that ended in an error
    tick_errors_total: AtomicU64,
    /// Drivers currently running
    active_drivers: AtomicU64,

    // === WRITER ===
    /// Messages read from the broker
    messages_consumed_total: AtomicU64,
    /// Messages that failed to decode
    decode_failures_total: AtomicU64,
    /// Per-record store write failures, by store
    store_write_failures: [AtomicU64; 3],
    /// Records fully written
    records_written_total: AtomicU64,
    /// Batches processed
    batches_total: AtomicU64,
    /// Batches that failed after all retries
    batches_failed_total: AtomicU64,
    /// Batch attempts that were retried
    batch_retries_total: AtomicU64,
    /// Relational transactions committed
    relational_commits_total: AtomicU64,
    /// Relational transactions that failed to commit
    relational_commit_failures_total: AtomicU64,

    // === HISTOGRAM: batch_duration_seconds ===
    batch_duration_sum_ms: AtomicU64,
    batch_duration_count: AtomicU64,
    /// Buckets: [0.05s .. 10.0s, +Inf]
    batch_duration_buckets: [AtomicU64; 9],
}

impl PipelineMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::default()
    }

    // === COUNTER RECORDING ===

    /// Record a record handed to the emitter.
    pub fn record_emitted(&self, topic: Topic) {
        self.records_emitted[topic_index(topic)].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed delivery.
    pub fn record_delivery_failure(&self) {
        self.delivery_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record several undelivered messages at once.
    pub fn record_delivery_failures(&self, count: u64) {
        self.delivery_failures_total
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record a driver tick that failed.
    pub fn record_tick_error(&self) {
        self.tick_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record consumed messages.
    pub fn record_messages_consumed(&self, count: u64) {
        self.messages_consumed_total
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record records of a batch that failed to decode.
    pub fn record_decode_failures(&self, count: u64) {
        self.decode_failures_total
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record per-record write failures against a store.
    pub fn record_store_failures(&self, store: StoreKind, count: u64) {
        self.store_write_failures[store.index()].fetch_add(count, Ordering::Relaxed);
    }

    /// Record a processed batch with its duration.
    pub fn record_batch(&self, records_written: usize, duration: Duration) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
        self.records_written_total
            .fetch_add(records_written as u64, Ordering::Relaxed);

        let duration_ms = duration.as_millis() as u64;
        self.batch_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.batch_duration_count.fetch_add(1, Ordering::Relaxed);

        // Buckets are cumulative (le = less than or equal)
        for (i, &bucket_ms) in BATCH_DURATION_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bucket_ms {
                self.batch_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.batch_duration_buckets[BATCH_DURATION_BUCKETS_MS.len()]
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch that failed after all retries.
    pub fn record_batch_failed(&self) {
        self.batches_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch retry.
    pub fn record_batch_retry(&self) {
        self.batch_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a relational commit.
    pub fn record_commit(&self) {
        self.relational_commits_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a relational commit failure.
    pub fn record_commit_failure(&self) {
        self.relational_commit_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    // === GAUGE UPDATES ===

    /// A driver started.
    pub fn driver_started(&self) {
        self.active_drivers.fetch_add(1, Ordering::Relaxed);
    }

    /// A driver stopped.
    pub fn driver_stopped(&self) {
        let _ = self
            .active_drivers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    // === GETTERS ===

    /// Records emitted on a topic.
    pub fn records_emitted(&self, topic: Topic) -> u64 {
        self.records_emitted[topic_index(topic)].load(Ordering::Relaxed)
    }

    /// Records emitted across all topics.
    pub fn records_emitted_total(&self) -> u64 {
        Topic::ALL.iter().map(|t| self.records_emitted(*t)).sum()
    }

    /// Failed deliveries.
    pub fn delivery_failures_total(&self) -> u64 {
        self.delivery_failures_total.load(Ordering::Relaxed)
    }

    /// Failed driver ticks.
    pub fn tick_errors_total(&self) -> u64 {
        self.tick_errors_total.load(Ordering::Relaxed)
    }

    /// Running drivers.
    pub fn active_drivers(&self) -> u64 {
        self.active_drivers.load(Ordering::Relaxed)
    }

    /// Consumed messages.
    pub fn messages_consumed_total(&self) -> u64 {
        self.messages_consumed_total.load(Ordering::Relaxed)
    }

    /// Decode failures.
    pub fn decode_failures_total(&self) -> u64 {
        self.decode_failures_total.load(Ordering::Relaxed)
    }

    /// Write failures against a store.
    pub fn store_failures(&self, store: StoreKind) -> u64 {
        self.store_write_failures[store.index()].load(Ordering::Relaxed)
    }

    /// Records fully written.
    pub fn records_written_total(&self) -> u64 {
        self.records_written_total.load(Ordering::Relaxed)
    }

    /// Processed batches.
    pub fn batches_total(&self) -> u64 {
        self.batches_total.load(Ordering::Relaxed)
    }

    /// Batches failed after all retries.
    pub fn batches_failed_total(&self) -> u64 {
        self.batches_failed_total.load(Ordering::Relaxed)
    }

    /// Batch retries.
    pub fn batch_retries_total(&self) -> u64 {
        self.batch_retries_total.load(Ordering::Relaxed)
    }

    /// Relational commits.
    pub fn relational_commits_total(&self) -> u64 {
        self.relational_commits_total.load(Ordering::Relaxed)
    }

    /// Relational commit failures.
    pub fn relational_commit_failures_total(&self) -> u64 {
        self.relational_commit_failures_total
            .load(Ordering::Relaxed)
    }

    /// Batch duration histogram data for Prometheus export.
    pub fn batch_duration_histogram(&self) -> BatchDurationHistogram {
        let mut buckets = [(0.0, 0); 8];
        for (i, &bucket_ms) in BATCH_DURATION_BUCKETS_MS.iter().enumerate() {
            buckets[i] = (
                bucket_ms as f64 / 1000.0,
                self.batch_duration_buckets[i].load(Ordering::Relaxed),
            );
        }

        BatchDurationHistogram {
            sum_seconds: self.batch_duration_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.batch_duration_count.load(Ordering::Relaxed),
            buckets,
            inf_bucket: self.batch_duration_buckets[BATCH_DURATION_BUCKETS_MS.len()]
                .load(Ordering::Relaxed),
        }
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    /// ```
    /// use fleetpipe_core::metrics::PipelineMetrics;
    ///
    /// let metrics = PipelineMetrics::new();
    /// metrics.record_messages_consumed(3);
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("fleetpipe_messages_consumed_total 3"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        self.export_prometheus_text_with_prefix("fleetpipe")
    }

    /// Export metrics in Prometheus text format with a custom prefix.
    pub fn export_prometheus_text_with_prefix(&self, prefix: &str) -> String {
        let mut out = String::with_capacity(4096);

        // === COUNTERS ===

        header(&mut out, prefix, "records_emitted_total", "Records handed to the producer", "counter");
        for topic in Topic::ALL {
            let _ = writeln!(
                out,
                "{}_records_emitted_total{{topic=\"{}\"}} {}",
                prefix,
                topic,
                self.records_emitted(topic)
            );
        }
        out.push('\n');

        single(&mut out, prefix, "delivery_failures_total", "Records the broker did not acknowledge", "counter", self.delivery_failures_total());
        single(&mut out, prefix, "tick_errors_total", "Device driver ticks that failed", "counter", self.tick_errors_total());
        single(&mut out, prefix, "messages_consumed_total", "Messages read from the broker", "counter", self.messages_consumed_total());
        single(&mut out, prefix, "decode_failures_total", "Messages that failed to decode", "counter", self.decode_failures_total());

        header(&mut out, prefix, "store_write_failures_total", "Per-record write failures by store", "counter");
        for store in StoreKind::ALL {
            let _ = writeln!(
                out,
                "{}_store_write_failures_total{{store=\"{}\"}} {}",
                prefix,
                store.as_label(),
                self.store_failures(store)
            );
        }
        out.push('\n');

        single(&mut out, prefix, "records_written_total", "Records written to their stores", "counter", self.records_written_total());
        single(&mut out, prefix, "batches_total", "Micro-batches processed", "counter", self.batches_total());
        single(&mut out, prefix, "batches_failed_total", "Micro-batches failed after retries", "counter", self.batches_failed_total());
        single(&mut out, prefix, "batch_retries_total", "Micro-batch retry attempts", "counter", self.batch_retries_total());
        single(&mut out, prefix, "relational_commits_total", "Relational transactions committed", "counter", self.relational_commits_total());
        single(&mut out, prefix, "relational_commit_failures_total", "Relational transactions that failed to commit", "counter", self.relational_commit_failures_total());

        // === GAUGES ===

        single(&mut out, prefix, "active_drivers", "Device drivers currently running", "gauge", self.active_drivers());

        // === HISTOGRAM: batch_duration_seconds ===

        let hist = self.batch_duration_histogram();
        header(&mut out, prefix, "batch_duration_seconds", "Duration of micro-batch writes", "histogram");
        for (le, count) in &hist.buckets {
            let _ = writeln!(
                out,
                "{}_batch_duration_seconds_bucket{{le=\"{}\"}} {}",
                prefix, le, count
            );
        }
        let _ = writeln!(
            out,
            "{}_batch_duration_seconds_bucket{{le=\"+Inf\"}} {}",
            prefix, hist.inf_bucket
        );
        let _ = writeln!(out, "{}_batch_duration_seconds_sum {}", prefix, hist.sum_seconds);
        let _ = writeln!(out, "{}_batch_duration_seconds_count {}", prefix, hist.count);

        out
    }
}

fn header(out: &mut String, prefix: &str, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {}_{} {}", prefix, name, help);
    let _ = writeln!(out, "# TYPE {}_{} {}", prefix, name, kind);
}

fn single(out: &mut String, prefix: &str, name: &str, help: &str, kind: &str, value: u64) {
    header(out, prefix, name, help, kind);
    let _ = writeln!(out, "{}_{} {}", prefix, name, value);
    out.push('\n');
}

/// Batch duration histogram data for export.
#[derive(Debug, Clone)]
pub struct BatchDurationHistogram {
    /// Sum of all observations in seconds
    pub sum_seconds: f64,
    /// Total count of observations
    pub count: u64,
    /// Bucket counts: (le_boundary_seconds, count)
    pub buckets: [(f64, u64); 8],
    /// +Inf bucket count
    pub inf_bucket: u64,
}
