//! Pipeline metrics exported in Prometheus text format.

mod prometheus;

pub use prometheus::{BatchDurationHistogram, PipelineMetrics, StoreKind};
