//! Multi-topic Kafka reader.
//!
//! Subscribes to every telemetry topic with one consumer group. Uses the
//! CooperativeSticky assignor for minimal rebalance disruption and manual
//! offset commits, so offsets only move after a batch has been written.

use crate::config::{KafkaConfig, OffsetReset};
use crate::kafka::RetryConfig;
use crate::telemetry::Topic;
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Source of raw telemetry messages with explicit offset commits.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Collect up to `max_messages`, waiting at most `timeout`.
    async fn poll_batch(&self, max_messages: usize, timeout: Duration) -> Result<Vec<KafkaMessage>>;

    /// Mark every message up to and including the given offsets as consumed.
    async fn commit_offsets(&self, offsets: &[(String, i32, i64)]) -> Result<()>;
}

/// Build the librdkafka consumer configuration.
pub fn consumer_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", config.bootstrap_servers.join(","))
        .set("group.id", &config.consumer_group)
        .set("client.id", format!("{}-reader", config.client_id))
        // Manual commits only, after the batch writer returns
        .set("enable.auto.commit", "false")
        .set(
            "auto.offset.reset",
            match config.auto_offset_reset {
                OffsetReset::Earliest => "earliest",
                OffsetReset::Latest => "latest",
            },
        )
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set(
            "heartbeat.interval.ms",
            config.heartbeat_interval_ms.to_string(),
        )
        // Must exceed the slowest batch write, or the group evicts us mid-batch
        .set(
            "max.poll.interval.ms",
            config.max_poll_interval_ms.to_string(),
        )
        .set("partition.assignment.strategy", "cooperative-sticky")
        .set("enable.auto.offset.store", "false");

    config.security.apply(&mut client_config);
    client_config
}

/// Kafka consumer subscribed to all telemetry topics.
pub struct MultiTopicReader {
    consumer: StreamConsumer,
    retry_config: RetryConfig,
}

impl MultiTopicReader {
    /// Create the consumer and subscribe to every topic.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = consumer_client_config(config).create().map_err(|e| {
            Error::Kafka(KafkaError::ConnectionFailed {
                broker: config.bootstrap_servers.join(","),
                message: e.to_string(),
            })
        })?;

        let topics: Vec<&str> = Topic::ALL.iter().map(|t| t.as_str()).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| Error::Kafka(KafkaError::ConsumerGroup(e.to_string())))?;

        info!(
            topics = ?topics,
            group = %config.consumer_group,
            servers = %config.bootstrap_servers.join(","),
            "Kafka reader subscribed"
        );

        Ok(Self {
            consumer,
            retry_config: RetryConfig::default(),
        })
    }

    /// Set custom retry configuration for offset commits.
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Convert a borrowed message to an owned KafkaMessage.
    fn convert_message(msg: &BorrowedMessage) -> KafkaMessage {
        KafkaMessage {
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|v| v.to_vec()),
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp: msg.timestamp().to_millis().unwrap_or(0),
            headers: Self::extract_headers(msg),
        }
    }

    /// Extract headers from a message.
    fn extract_headers(msg: &BorrowedMessage) -> Vec<(String, Vec<u8>)> {
        msg.headers()
            .map(|headers| {
                (0..headers.count())
                    .map(|i| {
                        let header = headers.get(i);
                        (header.key.to_string(), header.value.unwrap_or(&[]).to_vec())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn commit_once(&self, offsets: &[(String, i32, i64)]) -> Result<()> {
        let mut tpl = TopicPartitionList::new();

        for (topic, partition, offset) in offsets {
            // Committed offset is the next offset to read
            tpl.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))
                .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))
    }
}

#[async_trait]
impl MessageSource for MultiTopicReader {
    async fn poll_batch(&self, max_messages: usize, timeout: Duration) -> Result<Vec<KafkaMessage>> {
        use futures::StreamExt;

        let mut batch = Vec::with_capacity(max_messages);
        let deadline = tokio::time::Instant::now() + timeout;
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        while batch.len() < max_messages {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(Ok(msg))) => batch.push(Self::convert_message(&msg)),
                Ok(Some(Err(e))) => {
                    return Err(Error::Kafka(KafkaError::ConsumerGroup(e.to_string())));
                }
                Ok(None) | Err(_) => break,
            }
        }

        Ok(batch)
    }

    /// Commit with exponential backoff retry.
    async fn commit_offsets(&self, offsets: &[(String, i32, i64)]) -> Result<()> {
        let mut attempt = 0;

        loop {
            match self.commit_once(offsets) {
                Ok(()) => {
                    debug!(offsets = ?offsets, "Batch offsets committed");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retry_config.max_retries {
                        warn!(
                            attempt = attempt,
                            max_retries = self.retry_config.max_retries,
                            error = %e,
                            "Batch offset commit failed after max retries"
                        );
                        return Err(e);
                    }

                    let delay = self.retry_config.calculate_delay(attempt);
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Batch offset commit failed, retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// A Kafka message with all metadata.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    /// Message key (optional)
    pub key: Option<Vec<u8>>,

    /// Message value (optional)
    pub value: Option<Vec<u8>>,

    /// Topic name
    pub topic: String,

    /// Partition number
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Message timestamp (milliseconds since epoch)
    pub timestamp: i64,

    /// Message headers
    pub headers: Vec<(String, Vec<u8>)>,
}

impl KafkaMessage {
    /// Get the message key as a string.
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_ref().and_then(|k| std::str::from_utf8(k).ok())
    }
}
