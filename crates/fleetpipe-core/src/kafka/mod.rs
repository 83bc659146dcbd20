//! Kafka plumbing: the telemetry emitter, the multi-topic reader, topic
//! provisioning and in-memory doubles of both ends.

mod admin;
mod consumer;
mod memory;
mod producer;
mod retry;

pub use admin::{create_topics, TopicOutcome};
pub use consumer::{consumer_client_config, KafkaMessage, MessageSource, MultiTopicReader};
pub use memory::{partition_for, MemoryEmitter, MemorySource};
pub use producer::{
    producer_client_config, Delivery, DeliveryHandle, EventEmitter, FlushReport, KafkaEmitter,
};
pub use retry::RetryConfig;
