//! Topic provisioning.

use crate::config::KafkaConfig;
use crate::error::KafkaError;
use crate::telemetry::Topic;
use crate::Result;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{info, warn};

/// What happened to one topic during provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicOutcome {
    Created(String),
    AlreadyExists(String),
}

impl TopicOutcome {
    /// Topic name.
    pub fn name(&self) -> &str {
        match self {
            TopicOutcome::Created(name) | TopicOutcome::AlreadyExists(name) => name,
        }
    }
}

/// Create every telemetry topic with `partitions` partitions.
///
/// Topics that already exist are accepted as they are; their partition
/// count is not changed.
pub async fn create_topics(
    config: &KafkaConfig,
    partitions: i32,
    replication: i32,
) -> Result<Vec<TopicOutcome>> {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", config.bootstrap_servers.join(","));
    config.security.apply(&mut client_config);

    let admin: AdminClient<DefaultClientContext> =
        client_config
            .create()
            .map_err(|e| KafkaError::ConnectionFailed {
                broker: config.bootstrap_servers.join(","),
                message: e.to_string(),
            })?;

    let new_topics: Vec<NewTopic> = Topic::ALL
        .iter()
        .map(|t| NewTopic::new(t.as_str(), partitions, TopicReplication::Fixed(replication)))
        .collect();
    let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

    let results = admin
        .create_topics(new_topics.iter(), &options)
        .await
        .map_err(|e| KafkaError::Admin(e.to_string()))?;

    let mut outcomes = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(name) => {
                info!(topic = %name, partitions, "Topic created");
                outcomes.push(TopicOutcome::Created(name));
            }
            Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                warn!(topic = %name, "Topic already exists, leaving as is");
                outcomes.push(TopicOutcome::AlreadyExists(name));
            }
            Err((name, code)) => {
                return Err(KafkaError::Admin(format!("{}: {}", name, code)).into());
            }
        }
    }

    Ok(outcomes)
}
