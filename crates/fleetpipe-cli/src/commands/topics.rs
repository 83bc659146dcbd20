//! Topics command implementation.

use anyhow::Result;
use fleetpipe_core::kafka::{create_topics, TopicOutcome};
use fleetpipe_core::Config;

/// Create the telemetry topics.
pub async fn create(config: Config, replication: i32) -> Result<()> {
    let partitions = config.simulator.partitions_per_topic;
    let outcomes = create_topics(&config.kafka, partitions, replication).await?;

    for outcome in &outcomes {
        match outcome {
            TopicOutcome::Created(name) => {
                println!("[OK]   {} created ({} partitions)", name, partitions)
            }
            TopicOutcome::AlreadyExists(name) => println!("[SKIP] {} already exists", name),
        }
    }
    Ok(())
}
