//! Configuration module for pg-fanout.
//!
//! Settings load from environment variables following the 12-factor
//! methodology. A component is enabled by the presence of its keys:
//!
//! - `LISTENER_URL` enables the replication listener
//! - `BUS_SERVERS` + `TOPIC_NAME` enable the Kafka sink; adding
//!   `READER_GROUP_ID` enables the Kafka listener instead
//! - `SEARCH_STORE_URL` enables the search sink
//! - `TRANSLATOR_STORE_URL` enables schema-log translation
//!
//! Durations are given in milliseconds. When both listeners are configured
//! the replication listener wins.

use std::env;
use std::time::Duration;

use crate::backoff::{ExponentialBackoff, Provider};
use crate::kafka::batch_writer::WriterConfig;
use crate::kafka::reader::{ReaderConfig, StartOffset};
use crate::search::IndexerConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub listener: ListenerConfig,
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ListenerConfig {
    pub postgres: Option<PostgresListenerConfig>,
    pub kafka: Option<KafkaListenerConfig>,
}

#[derive(Debug, Clone)]
pub struct PostgresListenerConfig {
    pub url: String,
    pub slot_name: String,
}

#[derive(Debug, Clone)]
pub struct KafkaListenerConfig {
    pub reader: ReaderConfig,
    pub commit_backoff: BackoffConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorConfig {
    pub kafka: Option<KafkaProcessorConfig>,
    pub search: Option<SearchProcessorConfig>,
    pub translator: Option<TranslatorConfig>,
}

#[derive(Debug, Clone)]
pub struct KafkaProcessorConfig {
    pub servers: Vec<String>,
    pub topic: TopicConfig,
    pub writer: WriterConfig,
}

#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub auto_create: bool,
}

#[derive(Debug, Clone)]
pub struct SearchProcessorConfig {
    pub url: String,
    pub indexer: IndexerConfig,
    pub cleanup_backoff: BackoffConfig,
}

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub url: String,
    pub cache_refresh_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_retries: u32,
}

impl BackoffConfig {
    pub fn provider(&self) -> Provider {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_retries: self.max_retries,
        }
        .provider()
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_string(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw}"))),
    }
}

fn env_duration_ms(key: &str, default_ms: u64) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(key, default_ms)?))
}

impl Config {
    /// Loads configuration from environment variables. Returns `Err` when a
    /// value cannot be parsed or the resulting wiring is invalid.
    pub fn from_env() -> Result<Self> {
        let config = Config {
            listener: ListenerConfig {
                postgres: Self::postgres_listener_from_env()?,
                kafka: Self::kafka_listener_from_env()?,
            },
            processor: ProcessorConfig {
                kafka: Self::kafka_processor_from_env()?,
                search: Self::search_processor_from_env()?,
                translator: Self::translator_from_env()?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn postgres_listener_from_env() -> Result<Option<PostgresListenerConfig>> {
        let Some(url) = env_string("LISTENER_URL") else {
            return Ok(None);
        };
        Ok(Some(PostgresListenerConfig {
            url,
            slot_name: env_string("LISTENER_SLOT_NAME")
                .unwrap_or_else(|| "pgfanout_slot".to_string()),
        }))
    }

    fn kafka_listener_from_env() -> Result<Option<KafkaListenerConfig>> {
        let (Some(servers), Some(topic), Some(group)) = (
            env_string("BUS_SERVERS"),
            env_string("TOPIC_NAME"),
            env_string("READER_GROUP_ID"),
        ) else {
            return Ok(None);
        };

        let start_offset = match env_string("READER_START_OFFSET") {
            None => StartOffset::Earliest,
            Some(raw) => raw.parse()?,
        };

        Ok(Some(KafkaListenerConfig {
            reader: ReaderConfig {
                servers: split_servers(&servers),
                topic,
                consumer_group_id: group,
                start_offset,
            },
            commit_backoff: BackoffConfig {
                initial_interval: env_duration_ms("COMMIT_BACKOFF_INITIAL", 1_000)?,
                max_interval: env_duration_ms("COMMIT_BACKOFF_MAX", 60_000)?,
                max_retries: env_parse("COMMIT_BACKOFF_RETRIES", 10u32)?,
            },
        }))
    }

    fn kafka_processor_from_env() -> Result<Option<KafkaProcessorConfig>> {
        let (Some(servers), Some(topic)) = (env_string("BUS_SERVERS"), env_string("TOPIC_NAME"))
        else {
            return Ok(None);
        };
        // the bus is a sink only when something else is the source
        if env_string("READER_GROUP_ID").is_some() {
            return Ok(None);
        }

        let batch_bytes = env_parse("WRITER_BATCH_BYTES", 1_572_864i64)?;
        let max_queue_bytes = env_string("WRITER_MAX_QUEUE_BYTES")
            .map(|raw| {
                raw.parse::<i64>().map_err(|_| {
                    Error::Config(format!("WRITER_MAX_QUEUE_BYTES has an invalid value: {raw}"))
                })
            })
            .transpose()?;

        Ok(Some(KafkaProcessorConfig {
            servers: split_servers(&servers),
            topic: TopicConfig {
                name: topic,
                partitions: env_parse("TOPIC_PARTITIONS", 1i32)?,
                replication_factor: env_parse("TOPIC_REPLICATION_FACTOR", 1i32)?,
                auto_create: env_parse("TOPIC_AUTO_CREATE", false)?,
            },
            writer: WriterConfig {
                batch_timeout: env_duration_ms("WRITER_BATCH_TIMEOUT", 1_000)?,
                batch_bytes,
                batch_size: env_parse("WRITER_BATCH_SIZE", 100usize)?,
                max_queue_bytes,
            },
        }))
    }

    fn search_processor_from_env() -> Result<Option<SearchProcessorConfig>> {
        let Some(url) = env_string("SEARCH_STORE_URL") else {
            return Ok(None);
        };
        Ok(Some(SearchProcessorConfig {
            url,
            indexer: IndexerConfig {
                batch_size: env_parse("SEARCH_BATCH_SIZE", 100usize)?,
                batch_time: env_duration_ms("SEARCH_BATCH_TIMEOUT", 1_000)?,
            },
            cleanup_backoff: BackoffConfig {
                initial_interval: env_duration_ms("SEARCH_CLEANUP_BACKOFF_INITIAL", 1_000)?,
                max_interval: env_duration_ms("SEARCH_CLEANUP_BACKOFF_MAX", 60_000)?,
                max_retries: env_parse("SEARCH_CLEANUP_BACKOFF_RETRIES", 5u32)?,
            },
        }))
    }

    fn translator_from_env() -> Result<Option<TranslatorConfig>> {
        let Some(url) = env_string("TRANSLATOR_STORE_URL") else {
            return Ok(None);
        };
        Ok(Some(TranslatorConfig {
            url,
            cache_refresh_interval: env_duration_ms(
                "TRANSLATOR_CACHE_REFRESH_INTERVAL",
                300_000,
            )?,
        }))
    }

    pub fn validate(&self) -> Result<()> {
        if self.listener.postgres.is_none() && self.listener.kafka.is_none() {
            return Err(Error::Config(
                "need at least one listener configured".to_string(),
            ));
        }
        if self.processor.kafka.is_none() && self.processor.search.is_none() {
            return Err(Error::Config(
                "need at least one processor configured".to_string(),
            ));
        }
        if let Some(kafka) = &self.processor.kafka {
            if let Some(max_queue_bytes) = kafka.writer.max_queue_bytes {
                if max_queue_bytes < kafka.writer.batch_bytes {
                    return Err(Error::Config(
                        "WRITER_MAX_QUEUE_BYTES must be equal or bigger than WRITER_BATCH_BYTES"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn split_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            listener: ListenerConfig {
                postgres: Some(PostgresListenerConfig {
                    url: "postgres://localhost:5432/db".to_string(),
                    slot_name: "pgfanout_slot".to_string(),
                }),
                kafka: None,
            },
            processor: ProcessorConfig {
                kafka: Some(KafkaProcessorConfig {
                    servers: vec!["localhost:9092".to_string()],
                    topic: TopicConfig {
                        name: "wal-events".to_string(),
                        partitions: 1,
                        replication_factor: 1,
                        auto_create: false,
                    },
                    writer: WriterConfig::default(),
                }),
                search: None,
                translator: None,
            },
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_listener_required() {
        let mut config = base_config();
        config.listener.postgres = None;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_processor_required() {
        let mut config = base_config();
        config.processor.kafka = None;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_queue_bytes_must_cover_batch() {
        let mut config = base_config();
        let writer = &mut config.processor.kafka.as_mut().unwrap().writer;
        writer.batch_bytes = 1024;
        writer.max_queue_bytes = Some(512);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config
            .processor
            .kafka
            .as_mut()
            .unwrap()
            .writer
            .max_queue_bytes = Some(1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_split_servers() {
        assert_eq!(
            split_servers("a:9092, b:9092,,"),
            vec!["a:9092".to_string(), "b:9092".to_string()]
        );
    }
}
