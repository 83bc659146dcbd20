//! Error types for fleetpipe core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! None of these are fatal to the process on their own: drivers survive
//! per-tick errors and the batch writer survives per-record errors.

use thiserror::Error;

/// Result type alias for fleetpipe operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for fleetpipe.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka-related error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Device registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Record decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Store-related error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

/// Kafka-specific errors.
#[derive(Error, Debug, Clone)]
pub enum KafkaError {
    /// Failed to connect to broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Offset commit failed
    #[error("Offset commit failed: {0}")]
    OffsetCommit(String),

    /// A record could not be delivered to the broker
    #[error("Delivery to {topic} failed for key {key}: {message}")]
    Delivery {
        topic: String,
        key: String,
        message: String,
    },

    /// Producer queue rejected the record at enqueue time
    #[error("Producer queue full for topic {0}")]
    QueueFull(String),

    /// Flush did not drain the producer queue in time
    #[error("Flush timed out with {pending} undelivered messages")]
    FlushIncomplete { pending: usize },

    /// Admin operation failed
    #[error("Admin operation failed: {0}")]
    Admin(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Device registry errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// Device id was never registered
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Position step would move a device backwards or is not finite
    #[error("Invalid step for {device_id}: delta_lat={delta_lat}, delta_lon={delta_lon}")]
    InvalidStep {
        device_id: String,
        delta_lat: f64,
        delta_lon: f64,
    },
}

/// Record decode errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Topic is not one of the telemetry topics
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Message carried no payload
    #[error("Empty payload on topic {0}")]
    EmptyPayload(String),

    /// Payload is missing fields or has fields of the wrong type
    #[error("Malformed record on topic {topic}: {message}")]
    MalformedRecord { topic: String, message: String },
}

/// Store-specific errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Could not obtain a connection to the store
    #[error("{store} connection failed: {message}")]
    Connection {
        store: &'static str,
        message: String,
    },

    /// A single record write failed
    #[error("{store} write failed for {key}: {message}")]
    Write {
        store: &'static str,
        key: String,
        message: String,
    },

    /// The batch transaction could not be committed
    #[error("Commit failed for batch {batch_id}: {message}")]
    Commit { batch_id: u64, message: String },

    /// A read-side query failed
    #[error("{store} query failed: {message}")]
    Query {
        store: &'static str,
        message: String,
    },

    /// Record content cannot be mapped onto the store layout
    #[error("Invalid record {key}: {message}")]
    InvalidRecord { key: String, message: String },
}

impl StoreError {
    /// Whether this error means the store could not be reached at all.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection { .. })
    }
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
