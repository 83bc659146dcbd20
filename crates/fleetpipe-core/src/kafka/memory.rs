//! In-process broker doubles.
//!
//! [`MemoryEmitter`] records what the simulator publishes and
//! [`MemorySource`] replays messages into the ingestion engine. Both support
//! failure injection and back the `--dry-run` modes of the CLI.

use crate::error::KafkaError;
use crate::kafka::{Delivery, DeliveryHandle, EventEmitter, FlushReport, KafkaMessage, MessageSource};
use crate::telemetry::Topic;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Partition a key maps to, using CRC32 like librdkafka's `consistent_random`.
pub fn partition_for(key: &str, partitions: i32) -> i32 {
    let partitions = partitions.max(1) as u32;
    (crc32fast::hash(key.as_bytes()) % partitions) as i32
}

#[derive(Default)]
struct EmitterLog {
    messages: Vec<KafkaMessage>,
    next_offsets: HashMap<(Topic, i32), i64>,
}

/// Emitter that appends to an in-memory log.
pub struct MemoryEmitter {
    partitions: i32,
    log: Mutex<EmitterLog>,
    fail_deliveries: AtomicBool,
    reject_enqueue: AtomicBool,
    stalled: AtomicUsize,
}

impl MemoryEmitter {
    /// Create an emitter spreading keys over `partitions` partitions per topic.
    pub fn new(partitions: i32) -> Self {
        Self {
            partitions: partitions.max(1),
            log: Mutex::new(EmitterLog::default()),
            fail_deliveries: AtomicBool::new(false),
            reject_enqueue: AtomicBool::new(false),
            stalled: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent delivery resolve with an error.
    pub fn fail_deliveries(&self, fail: bool) {
        self.fail_deliveries.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `send` fail at enqueue time.
    pub fn reject_enqueue(&self, reject: bool) {
        self.reject_enqueue.store(reject, Ordering::SeqCst);
    }

    /// Report `count` messages as stuck on the next flush.
    pub fn stall_flush(&self, count: usize) {
        self.stalled.store(count, Ordering::SeqCst);
    }

    /// Every accepted message, in submission order.
    pub fn messages(&self) -> Vec<KafkaMessage> {
        self.log.lock().messages.clone()
    }

    /// Accepted messages on one topic.
    pub fn messages_for(&self, topic: Topic) -> Vec<KafkaMessage> {
        self.log
            .lock()
            .messages
            .iter()
            .filter(|m| m.topic == topic.as_str())
            .cloned()
            .collect()
    }

    /// Number of accepted messages.
    pub fn len(&self) -> usize {
        self.log.lock().messages.len()
    }

    /// Whether nothing was accepted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventEmitter for MemoryEmitter {
    fn send(
        &self,
        topic: Topic,
        key: &str,
        payload: Vec<u8>,
    ) -> std::result::Result<DeliveryHandle, KafkaError> {
        if self.reject_enqueue.load(Ordering::SeqCst) {
            return Err(KafkaError::QueueFull(topic.as_str().to_string()));
        }

        let key = key.to_string();
        if self.fail_deliveries.load(Ordering::SeqCst) {
            let error = KafkaError::Delivery {
                topic: topic.as_str().to_string(),
                key,
                message: "injected delivery failure".into(),
            };
            return Ok(futures::future::ready(Err(error)).boxed());
        }

        let partition = partition_for(&key, self.partitions);
        let mut log = self.log.lock();
        let next = log.next_offsets.entry((topic, partition)).or_insert(0);
        let offset = *next;
        *next += 1;

        log.messages.push(KafkaMessage {
            key: Some(key.as_bytes().to_vec()),
            value: Some(payload),
            topic: topic.as_str().to_string(),
            partition,
            offset,
            timestamp: chrono::Utc::now().timestamp_millis(),
            headers: vec![],
        });

        let delivery = Delivery {
            topic,
            key,
            partition,
            offset,
        };
        Ok(futures::future::ready(Ok(delivery)).boxed())
    }

    async fn flush(&self, _timeout: Duration) -> FlushReport {
        FlushReport {
            undelivered: self.stalled.swap(0, Ordering::SeqCst),
        }
    }
}

/// Message source replaying an in-memory queue.
pub struct MemorySource {
    pending: Mutex<VecDeque<KafkaMessage>>,
    committed: Mutex<HashMap<(String, i32), i64>>,
    fail_commits: AtomicBool,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::from_messages(Vec::new())
    }

    /// Create a source that yields `messages` in order.
    pub fn from_messages(messages: Vec<KafkaMessage>) -> Self {
        Self {
            pending: Mutex::new(messages.into()),
            committed: Mutex::new(HashMap::new()),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Append a message.
    pub fn push(&self, message: KafkaMessage) {
        self.pending.lock().push_back(message);
    }

    /// Messages not yet polled.
    pub fn remaining(&self) -> usize {
        self.pending.lock().len()
    }

    /// Next offset to read for a partition, as committed.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.committed
            .lock()
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Make subsequent commits fail.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn poll_batch(&self, max_messages: usize, timeout: Duration) -> Result<Vec<KafkaMessage>> {
        let batch: Vec<KafkaMessage> = {
            let mut pending = self.pending.lock();
            let take = max_messages.min(pending.len());
            pending.drain(..take).collect()
        };

        if batch.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(batch)
    }

    async fn commit_offsets(&self, offsets: &[(String, i32, i64)]) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::Kafka(KafkaError::OffsetCommit(
                "injected commit failure".into(),
            )));
        }

        let mut committed = self.committed.lock();
        for (topic, partition, offset) in offsets {
            committed.insert((topic.clone(), *partition), offset + 1);
        }
        Ok(())
    }
}
