//! Micro-batch assembly and the fan-out writer.

mod batch;
mod fanout;

pub use batch::{BatchRecord, MicroBatch};
pub use fanout::{BatchFanOutWriter, BatchReport, StoreFailures, DEFAULT_CONCURRENCY};
