//! rdkafka-backed implementation of the bus writer boundary.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use super::{Message, MessageWriter};
use crate::{Error, Result};

pub struct KafkaMessageWriter {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaMessageWriter {
    pub fn new(brokers: &[String], topic: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        info!(brokers = ?brokers, topic = %topic, "Creating Kafka producer");

        // the batch writer owns batching, so linger is kept at zero to
        // trigger the write as soon as a batch is handed over
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("linger.ms", "10")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "30000")
            .set("request.timeout.ms", "20000")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka producer: {}", e);
                Error::Kafka(e)
            })?;

        Ok(Self {
            producer,
            topic,
            delivery_timeout: Duration::from_secs(30),
        })
    }
}

#[async_trait]
impl MessageWriter for KafkaMessageWriter {
    async fn write_messages(&self, msgs: &[Message]) -> Result<()> {
        // queue everything first, then wait for every delivery report; a
        // single failed report fails the whole batch so it is never
        // checkpointed
        let mut deliveries = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let record = FutureRecord::to(&self.topic)
                .key(&msg.key)
                .payload(&msg.value);
            match self.producer.send_result(record) {
                Ok(delivery) => deliveries.push(delivery),
                Err((e, _)) => return Err(Error::Kafka(e)),
            }
        }

        for delivery in deliveries {
            match tokio::time::timeout(self.delivery_timeout, delivery).await {
                Ok(Ok(Ok((partition, offset)))) => {
                    debug!(partition, offset, "message delivered");
                }
                Ok(Ok(Err((e, _)))) => return Err(Error::Kafka(e)),
                Ok(Err(_)) | Err(_) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::MessageProduction(
                        rdkafka::types::RDKafkaErrorCode::MessageTimedOut,
                    )))
                }
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("Flushing Kafka producer queue");
        self.producer.flush(self.delivery_timeout).map_err(|e| {
            error!("Failed to flush producer: {}", e);
            Error::Kafka(e)
        })
    }
}
