//! Topic auto-provisioning for the bus sink.

use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::ClientConfig;
use tracing::{debug, info, warn};

use crate::{Error, Result};

pub struct TopicManager {
    admin_client: AdminClient<DefaultClientContext>,
    partitions: i32,
    replication_factor: i32,
}

impl TopicManager {
    pub fn new(brokers: &[String], partitions: i32, replication_factor: i32) -> Result<Self> {
        let admin_client: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .create()
            .map_err(Error::Kafka)?;

        Ok(Self {
            admin_client,
            partitions,
            replication_factor,
        })
    }

    /// Creates the topic if it does not already exist. Partition count fixes
    /// the fan-out of the per-schema routing keys, so the topic is never
    /// altered once present.
    pub async fn ensure_topic(&self, topic_name: &str) -> Result<()> {
        match self.topic_exists(topic_name) {
            Ok(true) => {
                debug!("Topic '{}' already exists", topic_name);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to check if topic '{}' exists: {}", topic_name, e);
                return Err(e);
            }
        }

        info!(
            "Creating topic '{}' with {} partitions",
            topic_name, self.partitions
        );
        let new_topic = NewTopic::new(
            topic_name,
            self.partitions,
            TopicReplication::Fixed(self.replication_factor),
        )
        .set("cleanup.policy", "delete");

        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

        let results = self
            .admin_client
            .create_topics(&[new_topic], &opts)
            .await
            .map_err(Error::Kafka)?;

        for result in results {
            match result {
                Ok(topic) => info!("Successfully created topic: {}", topic),
                Err((topic, rdkafka::types::RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Topic '{}' created concurrently", topic);
                }
                Err((_topic, error)) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::AdminOp(error)));
                }
            }
        }

        Ok(())
    }

    fn topic_exists(&self, topic_name: &str) -> Result<bool> {
        let metadata = self
            .admin_client
            .inner()
            .fetch_metadata(Some(topic_name), Duration::from_secs(5))
            .map_err(Error::Kafka)?;

        Ok(metadata
            .topics()
            .iter()
            .any(|topic| topic.name() == topic_name && topic.error().is_none()))
    }
}
