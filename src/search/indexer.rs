//! Batching indexer feeding the search store.
//!
//! Row events become document upserts or deletes, accumulated up to
//! `batch_size`/`batch_time` before being handed to the store retrier.
//! Schema-log events rotate the index version for their schema: the pending
//! batch is flushed first so documents never land in an index the alias has
//! already moved past. Whatever the retrier reports back as dropped is
//! logged per document with DATALOSS severity; delivery of the batch then
//! advances the checkpointer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{document_from_event, Document, SearchStore, StoreRetrier};
use crate::backoff::{self, Provider};
use crate::checkpoint::Checkpointer;
use crate::processor::Processor;
use crate::schemalog::{self, SchemaLogEntry};
use crate::wal;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub batch_size: usize,
    pub batch_time: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_time: Duration::from_secs(1),
        }
    }
}

enum Item {
    Doc(Box<Document>),
    SchemaChange(Box<SchemaLogEntry>),
    KeepAlive,
}

struct IndexMsg {
    item: Item,
    pos: wal::CommitPosition,
}

pub struct Indexer {
    store: Arc<dyn SearchStore>,
    retrier: StoreRetrier,
    checkpointer: Option<Arc<dyn Checkpointer>>,

    msg_tx: Mutex<Option<mpsc::Sender<IndexMsg>>>,
    msg_rx: Mutex<Option<mpsc::Receiver<IndexMsg>>>,

    batch_size: usize,
    batch_time: Duration,
    cleanup_backoff: Provider,
    cancel: CancellationToken,
}

impl Indexer {
    pub fn new(
        config: IndexerConfig,
        store: Arc<dyn SearchStore>,
        retrier: StoreRetrier,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        cleanup_backoff: Provider,
        cancel: CancellationToken,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(1);
        Self {
            store,
            retrier,
            checkpointer,
            msg_tx: Mutex::new(Some(msg_tx)),
            msg_rx: Mutex::new(Some(msg_rx)),
            batch_size: config.batch_size,
            batch_time: config.batch_time,
            cleanup_backoff,
            cancel,
        }
    }

    /// Accumulates and flushes batches until cancellation, channel close, or
    /// a store failure that survives the retry budget.
    pub async fn run(&self) -> Result<()> {
        let mut msg_rx = self
            .msg_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Replication {
                message: "indexer run loop already started".to_string(),
            })?;

        let mut ticker = tokio::time::interval(self.batch_time);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();

        let mut pending: Vec<Document> = Vec::new();
        let mut last_pos: Option<wal::CommitPosition> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Shutdown),
                _ = ticker.tick() => {
                    self.flush(&mut pending, &mut last_pos).await?;
                }
                maybe_msg = msg_rx.recv() => match maybe_msg {
                    None => {
                        self.flush(&mut pending, &mut last_pos).await?;
                        return Ok(());
                    }
                    Some(IndexMsg { item, pos }) => match item {
                        Item::Doc(doc) => {
                            pending.push(*doc);
                            advance(&mut last_pos, pos);
                            if pending.len() >= self.batch_size {
                                self.flush(&mut pending, &mut last_pos).await?;
                            }
                        }
                        Item::KeepAlive => {
                            advance(&mut last_pos, pos);
                            self.flush(&mut pending, &mut last_pos).await?;
                        }
                        Item::SchemaChange(entry) => {
                            // documents written under the previous version go
                            // out before the alias moves
                            self.flush(&mut pending, &mut last_pos).await?;
                            self.apply_schema_change(&entry).await?;
                            advance(&mut last_pos, pos);
                            self.flush(&mut pending, &mut last_pos).await?;
                        }
                    },
                },
            }
        }
    }

    pub fn close(&self) {
        self.msg_tx.lock().take();
    }

    async fn flush(
        &self,
        pending: &mut Vec<Document>,
        last_pos: &mut Option<wal::CommitPosition>,
    ) -> Result<()> {
        if !pending.is_empty() {
            let docs = std::mem::take(pending);
            debug!(size = docs.len(), "flushing document batch");
            let failed = self.retrier.send_documents(docs).await?;
            for doc_err in failed {
                error!(
                    severity = "DATALOSS",
                    document = %doc_err.document.id,
                    error = %doc_err.error,
                    "dropping document"
                );
            }
        }

        if let Some(pos) = last_pos.take() {
            if let Some(checkpointer) = &self.checkpointer {
                if !pos.is_empty() {
                    if let Err(err) = checkpointer.checkpoint(std::slice::from_ref(&pos)).await {
                        warn!(error = %err, "error updating commit position");
                    }
                }
            }
        }

        Ok(())
    }

    async fn apply_schema_change(&self, entry: &SchemaLogEntry) -> Result<()> {
        info!(
            schema = %entry.schema_name,
            version = entry.version,
            "applying schema change to search store"
        );
        let schedule = (self.cleanup_backoff)();
        backoff::retry(schedule.as_ref(), &self.cancel, |_| async move {
            self.store
                .ensure_index(&entry.schema_name, entry.version)
                .await?;
            self.store.alias(&entry.schema_name, entry.version).await
        })
        .await
    }

    async fn enqueue(&self, msg: IndexMsg) -> Result<()> {
        let tx = self
            .msg_tx
            .lock()
            .as_ref()
            .cloned()
            .ok_or(Error::Shutdown)?;
        tokio::select! {
            result = tx.send(msg) => result.map_err(|_| Error::Shutdown),
            _ = self.cancel.cancelled() => Err(Error::Shutdown),
        }
    }
}

fn advance(last_pos: &mut Option<wal::CommitPosition>, pos: wal::CommitPosition) {
    let advanced = match last_pos {
        Some(last) => (*last).partial_cmp(&pos) != Some(std::cmp::Ordering::Greater),
        None => true,
    };
    if advanced {
        *last_pos = Some(pos);
    }
}

#[async_trait]
impl Processor for Indexer {
    fn name(&self) -> &'static str {
        "search_indexer"
    }

    async fn process_event(&self, event: wal::Event) -> Result<()> {
        let item = match &event.data {
            None => Item::KeepAlive,
            Some(data) if schemalog::is_schema_log_event(data) => {
                let entry = SchemaLogEntry::from_wal_data(data)?;
                Item::SchemaChange(Box::new(entry))
            }
            Some(data) => match document_from_event(data) {
                Some(doc) => Item::Doc(Box::new(doc)),
                // transaction markers carry nothing to index
                None => return Ok(()),
            },
        };

        self.enqueue(IndexMsg {
            item,
            pos: event.commit_position,
        })
        .await
    }
}
