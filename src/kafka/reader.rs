//! Bus listener: replays previously published WAL events to a processor.
//!
//! Each fetched record is deserialized back into WAL data and emitted with
//! its (topic, partition, offset) coordinate as the commit position, so the
//! paired bus checkpointer can commit consumer-group offsets once the
//! processor has handled it.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message as _, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::checkpoint::OffsetCommitter;
use crate::listener::invoke_processor;
use crate::processor::Processor;
use crate::wal;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartOffset {
    #[default]
    Earliest,
    Latest,
}

impl FromStr for StartOffset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "earliest" => Ok(StartOffset::Earliest),
            "latest" => Ok(StartOffset::Latest),
            _ => Err(Error::Config(format!(
                "invalid start offset: {s}. Valid values: earliest, latest"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub servers: Vec<String>,
    pub topic: String,
    pub consumer_group_id: String,
    pub start_offset: StartOffset,
}

pub struct Reader {
    consumer: StreamConsumer,
}

impl Reader {
    pub fn new(config: &ReaderConfig) -> Result<Self> {
        let auto_offset_reset = match config.start_offset {
            StartOffset::Earliest => "earliest",
            StartOffset::Latest => "latest",
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.servers.join(","))
            .set("group.id", &config.consumer_group_id)
            .set("auto.offset.reset", auto_offset_reset)
            // offsets are committed by the checkpointer once processing is
            // durable, never on fetch
            .set("enable.auto.commit", "false")
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;
        info!(topic = %config.topic, group = %config.consumer_group_id, "Kafka reader subscribed");

        Ok(Self { consumer })
    }

    /// Fetches and processes records until cancellation or a fatal error.
    pub async fn listen(
        &self,
        processor: Arc<dyn Processor>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Shutdown),
                msg = self.consumer.recv() => msg?,
            };

            trace!(
                topic = %msg.topic(),
                partition = msg.partition(),
                offset = msg.offset(),
                "received"
            );

            let payload = msg.payload().ok_or_else(|| Error::InvalidMessage {
                message: "bus record with empty value".to_string(),
            })?;
            let data: wal::Data = serde_json::from_slice(payload)?;

            let event = wal::Event {
                data: Some(data),
                commit_position: wal::CommitPosition::bus(
                    msg.topic(),
                    msg.partition(),
                    msg.offset(),
                ),
            };

            if let Err(err) = invoke_processor(processor.as_ref(), event).await {
                if err.is_cancellation() {
                    return Err(err);
                }
                error!(
                    severity = "DATALOSS",
                    error = %err,
                    offset = msg.offset(),
                    "processing bus record"
                );
            }
        }
    }

    /// Cleanly leaving the group lets its partitions be re-allocated quickly.
    pub fn close(&self) {
        self.consumer.unsubscribe();
    }
}

#[async_trait]
impl OffsetCommitter for Reader {
    async fn commit_offsets(&self, offsets: &[(String, i32, i64)]) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for (topic, partition, offset) in offsets {
            // the committed offset is the next record to consume
            tpl.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))?;
        }
        self.consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Sync)?;
        Ok(())
    }
}
