//! Pipeline runtime: wires one listener to the configured processors and
//! owns the lifecycle.
//!
//! Shutdown is initiated by signal-driven cancellation, a sink run loop
//! returning an error, or the listener exiting. Order: the listener stops
//! first (no new admissions), processor input channels close, sender loops
//! drain or fail, downstream clients close. Every non-cancellation error
//! collected on the way is joined into the returned error.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{BusCheckpointer, Checkpointer, ReplicationCheckpointer};
use crate::config::Config;
use crate::kafka;
use crate::listener;
use crate::processor::{Fanout, Processor};
use crate::replication::{self, PostgresReplicationHandler};
use crate::schemalog::{CachedSchemaStore, PostgresSchemaStore, SchemaStore};
use crate::search;
use crate::translator::Translator;
use crate::{Error, Result};

pub struct Pipeline {
    config: Config,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Root cancellation token; cancelling it tears the pipeline down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<()> {
        let cancel = self.cancel.clone();

        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    cancel.cancel();
                }
            });
        }

        // source first: sinks checkpoint into it
        let mut replication_handler: Option<Arc<dyn replication::Handler>> = None;
        let mut bus_reader: Option<Arc<kafka::Reader>> = None;
        let checkpointer: Arc<dyn Checkpointer> =
            if let Some(pg) = &self.config.listener.postgres {
                let handler: Arc<dyn replication::Handler> = Arc::new(
                    PostgresReplicationHandler::new(&replication::postgres::Config {
                        url: pg.url.clone(),
                        slot_name: pg.slot_name.clone(),
                    })
                    .await?,
                );
                replication_handler = Some(handler.clone());
                Arc::new(ReplicationCheckpointer::new(handler))
            } else if let Some(bus) = &self.config.listener.kafka {
                let reader = Arc::new(kafka::Reader::new(&bus.reader)?);
                bus_reader = Some(reader.clone());
                Arc::new(BusCheckpointer::new(
                    reader,
                    bus.commit_backoff.provider(),
                    cancel.clone(),
                ))
            } else {
                return Err(Error::Config(
                    "need at least one listener configured".to_string(),
                ));
            };

        let mut sinks: Vec<Arc<dyn Processor>> = Vec::new();
        let mut sink_runs = Vec::new();

        let mut batch_writer: Option<Arc<kafka::BatchWriter>> = None;
        if let Some(bus) = &self.config.processor.kafka {
            if bus.topic.auto_create {
                let manager = kafka::TopicManager::new(
                    &bus.servers,
                    bus.topic.partitions,
                    bus.topic.replication_factor,
                )?;
                manager.ensure_topic(&bus.topic.name).await?;
            }

            let producer = Arc::new(kafka::KafkaMessageWriter::new(
                &bus.servers,
                bus.topic.name.clone(),
            )?);
            let writer = Arc::new(kafka::BatchWriter::new(
                bus.writer.clone(),
                producer,
                Some(checkpointer.clone()),
                cancel.clone(),
            )?);
            batch_writer = Some(writer.clone());
            sinks.push(writer.clone());
            sink_runs.push(tokio::spawn(async move { writer.run().await }));
            info!(topic = %bus.topic.name, "Kafka batch writer started");
        }

        let mut indexer: Option<Arc<search::Indexer>> = None;
        if let Some(cfg) = &self.config.processor.search {
            let store: Arc<dyn search::SearchStore> =
                Arc::new(search::OpenSearchStore::new(&cfg.url));
            let retrier = search::StoreRetrier::new(
                store.clone(),
                cfg.cleanup_backoff.provider(),
                cancel.clone(),
            );
            let idx = Arc::new(search::Indexer::new(
                cfg.indexer.clone(),
                store,
                retrier,
                Some(checkpointer.clone()),
                cfg.cleanup_backoff.provider(),
                cancel.clone(),
            ));
            indexer = Some(idx.clone());
            sinks.push(idx.clone());
            sink_runs.push(tokio::spawn(async move { idx.run().await }));
            info!(url = %cfg.url, "search indexer started");
        }

        let mut processor: Arc<dyn Processor> = if sinks.len() == 1 {
            sinks.pop().expect("one sink")
        } else {
            Arc::new(Fanout::new(sinks))
        };

        if let Some(cfg) = &self.config.processor.translator {
            let store = PostgresSchemaStore::new(&cfg.url).await?;
            let cached: Arc<dyn SchemaStore> = Arc::new(CachedSchemaStore::new(
                Arc::new(store),
                cfg.cache_refresh_interval,
            ));
            processor = Arc::new(Translator::new(
                processor,
                cached,
                translator_backoff(),
                cancel.clone(),
            ));
            info!("schema log translation enabled");
        }

        // a failing sink run loop tears everything down
        let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::channel::<Error>(sink_runs.len().max(1));
        let mut sink_waits = Vec::with_capacity(sink_runs.len());
        for handle in sink_runs {
            let fatal_tx = fatal_tx.clone();
            let cancel = cancel.clone();
            sink_waits.push(tokio::spawn(async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(join_err) => Err(Error::Replication {
                        message: format!("sink task aborted: {join_err}"),
                    }),
                };
                if let Err(err) = result {
                    if !err.is_cancellation() {
                        error!(error = %err, "sink failed, shutting down pipeline");
                        let _ = fatal_tx.try_send(err);
                        cancel.cancel();
                    }
                }
            }));
        }
        drop(fatal_tx);

        // run the listener on this task until it exits
        let listener_result = match (&replication_handler, &bus_reader) {
            (Some(handler), _) => {
                let l = listener::Listener::new(handler.clone(), processor, cancel.clone());
                let result = l.listen().await;
                if let Err(err) = l.close().await {
                    warn!(error = %err, "error closing replication handler");
                }
                result
            }
            (None, Some(reader)) => {
                let result = reader.listen(processor, &cancel).await;
                reader.close();
                result
            }
            (None, None) => unreachable!("validated config has a listener"),
        };

        // listener stopped: close processor inputs so the run loops flush
        // and exit, then wait for them
        if let Some(writer) = &batch_writer {
            if let Err(err) = writer.close().await {
                warn!(error = %err, "error closing batch writer");
            }
        }
        if let Some(idx) = &indexer {
            idx.close();
        }
        for wait in sink_waits {
            let _ = wait.await;
        }

        let mut errors = Vec::new();
        if let Err(err) = listener_result {
            if !err.is_cancellation() {
                errors.push(err);
            }
        }
        while let Some(err) = fatal_rx.recv().await {
            errors.push(err);
        }

        match errors.len() {
            0 => {
                info!("pipeline stopped");
                Ok(())
            }
            1 => Err(errors.pop().expect("one error")),
            _ => Err(Error::Pipeline(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }
}

/// Transient schema-log fetches back off briefly before giving up on the
/// event; the translator's caller treats exhaustion as a per-record failure.
fn translator_backoff() -> crate::backoff::Provider {
    crate::backoff::ExponentialBackoff {
        initial_interval: std::time::Duration::from_millis(500),
        max_interval: std::time::Duration::from_secs(10),
        max_retries: 3,
    }
    .provider()
}
