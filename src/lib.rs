//! # pg-fanout
//!
//! A PostgreSQL change-data-capture daemon that tails the database's logical
//! replication stream and fans row changes out to downstream consumers: a
//! Kafka bus and a search index. Replication progress only advances once the
//! corresponding payloads have been durably accepted downstream, giving
//! at-least-once delivery with per-schema ordering.
//!
//! ## Overview
//!
//! `pg-fanout` connects to PostgreSQL as a logical replication client, turns
//! decoded WAL messages into versioned events by consulting an append-only
//! schema log, and hands them to one or more processors:
//!
//! - **Kafka batch writer** - memory-bounded batching with per-schema routing
//! - **Search indexer** - batching bulk writer with severity-classified retry
//!
//! It can equally consume previously published events back off Kafka and feed
//! them to the search indexer, committing consumer-group offsets as progress.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pg_fanout::{Config, Pipeline, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration from environment variables
//!     let config = Config::from_env()?;
//!
//!     // Wire the listener to the configured processors and run until
//!     // cancelled or a fatal error tears the pipeline down
//!     Pipeline::new(config)?.run().await
//! }
//! ```
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables. The replication
//! listener is enabled by `LISTENER_URL`, the Kafka sink by `BUS_SERVERS` +
//! `TOPIC_NAME`, and the search sink by `SEARCH_STORE_URL`. See [`Config`]
//! for the full list of knobs.
//!
//! ## Architecture
//!
//! - [`wal`] - event model and commit positions
//! - [`listener`] - replication listener producing WAL events
//! - [`translator`] - schema-log aware event normalization
//! - [`kafka`] - Kafka reader, batch writer and topic management
//! - [`search`] - search indexer and retrying store writer
//! - [`checkpoint`] - ties replication progress to downstream delivery
//! - [`pipeline`] - lifecycle wiring and shutdown

pub mod backoff;

/// Checkpointers that advance source progress after downstream delivery
pub mod checkpoint;

/// Configuration structures and environment variable parsing
pub mod config;

/// Error types and result handling
pub mod error;

/// Kafka reader, batch writer, and topic management
pub mod kafka;

/// Listeners producing WAL events from the replication stream
pub mod listener;

/// Pipeline runtime wiring listener to processors
pub mod pipeline;

/// Processor trait and helpers
pub mod processor;

/// Raw replication protocol handling
pub mod replication;

/// Versioned table schema log store and cache
pub mod schemalog;

/// Search indexer with severity-classified retry
pub mod search;

/// Memory-budgeted admission control
pub mod semaphore;

/// Schema-log aware event translation
pub mod translator;

/// WAL event model and commit positions
pub mod wal;

pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::Pipeline;
