//! Ingestion engine: reader, decoder and fan-out writer in one loop.

mod ingestion;

pub use ingestion::{IngestionEngine, StoreHandles, SHUTDOWN_TIMEOUT};
