//! Micro-batches of decoded messages.

use crate::error::DecodeError;
use crate::kafka::KafkaMessage;
use crate::telemetry::{decode, TelemetryRecord};
use std::collections::BTreeMap;

/// One consumed message and its decode outcome.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub topic: String,
    pub key: Option<String>,
    pub partition: i32,
    pub offset: i64,
    pub record: Result<TelemetryRecord, DecodeError>,
}

impl BatchRecord {
    /// Decode one message. A missing payload decodes as empty.
    pub fn from_message(message: &KafkaMessage) -> Self {
        Self {
            topic: message.topic.clone(),
            key: message.key_str().map(str::to_string),
            partition: message.partition,
            offset: message.offset,
            record: decode(&message.topic, message.value.as_deref().unwrap_or_default()),
        }
    }

    /// Message key for log lines.
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or("-")
    }
}

/// The messages of one poll, each decoded independently.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    batch_id: u64,
    records: Vec<BatchRecord>,
}

impl MicroBatch {
    pub fn from_messages(batch_id: u64, messages: &[KafkaMessage]) -> Self {
        Self {
            batch_id,
            records: messages.iter().map(BatchRecord::from_message).collect(),
        }
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn records(&self) -> &[BatchRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records that failed to decode.
    pub fn decode_failures(&self) -> usize {
        self.records.iter().filter(|r| r.record.is_err()).count()
    }

    /// Highest offset per (topic, partition), malformed records included.
    ///
    /// Malformed records will never decode, so they are consumed with the
    /// batch rather than replayed.
    pub fn commit_offsets(&self) -> Vec<(String, i32, i64)> {
        let mut highest: BTreeMap<(&str, i32), i64> = BTreeMap::new();
        for record in &self.records {
            let entry = highest
                .entry((record.topic.as_str(), record.partition))
                .or_insert(record.offset);
            *entry = (*entry).max(record.offset);
        }

        highest
            .into_iter()
            .map(|((topic, partition), offset)| (topic.to_string(), partition, offset))
            .collect()
    }
}
