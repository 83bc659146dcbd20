//! Fleetpipe Core - logistics fleet telemetry simulation and ingestion
//!
//! This library provides both ends of a vehicle telemetry pipeline:
//!
//! - A device fleet simulator publishing logistics, location and alert
//!   records to Kafka, keyed by device for partition affinity
//! - A multi-topic ingestion engine decoding micro-batches and fanning them
//!   out to a latest-state cache (Redis), a position history (HBase) and an
//!   order/alarm store (MySQL)
//! - Per-record failure isolation with one relational transaction per batch

pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod simulator;
pub mod store;
pub mod telemetry;
pub mod writer;

// Re-export commonly used types
pub use config::Config;
pub use error::{DecodeError, KafkaError, RegistryError, StoreError};
pub use error::{Error, Result};
