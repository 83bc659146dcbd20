//! Telemetry emitter.
//!
//! Every emission returns its own [`DeliveryHandle`], a future that resolves
//! once the broker acknowledges or rejects the record. Handles may be awaited
//! from any task; nothing about delivery is tied to the submitting driver.

use crate::config::KafkaConfig;
use crate::error::KafkaError;
use crate::telemetry::{TelemetryRecord, Topic};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use rdkafka::error::{KafkaError as RdKafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{info, warn};

/// Broker acknowledgement of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: Topic,
    pub key: String,
    pub partition: i32,
    pub offset: i64,
}

/// Resolves when the broker acknowledges or rejects a record.
pub type DeliveryHandle = BoxFuture<'static, Result<Delivery, KafkaError>>;

/// Outcome of a flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Messages still queued when the flush gave up; they are discarded.
    pub undelivered: usize,
}

impl FlushReport {
    /// Whether every queued message was delivered.
    pub fn is_complete(&self) -> bool {
        self.undelivered == 0
    }
}

/// Publishes records onto the telemetry topics.
///
/// Implementations are shared by every device driver and must accept
/// concurrent submissions.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// Enqueue already-encoded bytes. Must not wait for the broker.
    fn send(&self, topic: Topic, key: &str, payload: Vec<u8>)
        -> Result<DeliveryHandle, KafkaError>;

    /// Wait up to `timeout` for queued messages to be delivered.
    async fn flush(&self, timeout: Duration) -> FlushReport;

    /// Encode `record` as JSON and enqueue it keyed by `key`.
    fn emit(
        &self,
        topic: Topic,
        key: &str,
        record: &TelemetryRecord,
    ) -> crate::Result<DeliveryHandle> {
        let payload = record.to_payload()?;
        Ok(self.send(topic, key, payload)?)
    }
}

/// Build the librdkafka producer configuration.
///
/// `consistent_random` hashes the key with CRC32, so one device always lands
/// on the same partition of every topic with the same partition count.
pub fn producer_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers.join(","))
        .set("client.id", &config.client_id)
        .set("acks", &config.producer.acks)
        .set("retries", config.producer.retries.to_string())
        .set("linger.ms", config.producer.linger_ms.to_string())
        .set("batch.size", config.producer.batch_size_bytes.to_string())
        .set(
            "message.timeout.ms",
            config.producer.message_timeout_ms.to_string(),
        )
        .set("partitioner", "consistent_random");
    config.security.apply(&mut client_config);
    client_config
}

/// Emitter backed by an rdkafka [`FutureProducer`].
#[derive(Clone)]
pub struct KafkaEmitter {
    producer: FutureProducer,
}

impl KafkaEmitter {
    /// Connect a producer.
    pub fn new(config: &KafkaConfig) -> crate::Result<Self> {
        let producer: FutureProducer =
            producer_client_config(config)
                .create()
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: config.bootstrap_servers.join(","),
                    message: e.to_string(),
                })?;

        info!(
            servers = %config.bootstrap_servers.join(","),
            client_id = %config.client_id,
            acks = %config.producer.acks,
            "Kafka producer created"
        );

        Ok(Self { producer })
    }
}

#[async_trait]
impl EventEmitter for KafkaEmitter {
    fn send(
        &self,
        topic: Topic,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<DeliveryHandle, KafkaError> {
        let record = FutureRecord::to(topic.as_str()).key(key).payload(&payload);

        match self.producer.send_result(record) {
            Ok(delivery) => {
                let key = key.to_string();
                Ok(async move {
                    match delivery.await {
                        Ok(Ok((partition, offset))) => Ok(Delivery {
                            topic,
                            key,
                            partition,
                            offset,
                        }),
                        Ok(Err((e, _message))) => Err(KafkaError::Delivery {
                            topic: topic.as_str().to_string(),
                            key,
                            message: e.to_string(),
                        }),
                        Err(_canceled) => Err(KafkaError::Delivery {
                            topic: topic.as_str().to_string(),
                            key,
                            message: "producer dropped before acknowledgement".into(),
                        }),
                    }
                }
                .boxed())
            }
            Err((e, _record)) => Err(enqueue_error(topic, key, e)),
        }
    }

    async fn flush(&self, timeout: Duration) -> FlushReport {
        let producer = self.producer.clone();
        let result =
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;

        let undelivered = self.producer.in_flight_count().max(0) as usize;
        match result {
            Ok(Ok(())) => info!("Producer flushed"),
            Ok(Err(e)) => warn!(error = %e, undelivered, "Producer flush incomplete"),
            Err(e) => warn!(error = %e, undelivered, "Producer flush task failed"),
        }

        FlushReport { undelivered }
    }
}

fn enqueue_error(topic: Topic, key: &str, error: RdKafkaError) -> KafkaError {
    if error.rdkafka_error_code() == Some(RDKafkaErrorCode::QueueFull) {
        KafkaError::QueueFull(topic.as_str().to_string())
    } else {
        KafkaError::Delivery {
            topic: topic.as_str().to_string(),
            key: key.to_string(),
            message: error.to_string(),
        }
    }
}
