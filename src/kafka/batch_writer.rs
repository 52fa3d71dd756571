//! Memory-bounded batching writer from WAL events to the bus.
//!
//! Serialized events are admitted through a byte semaphore so the queue can
//! hold variable-size messages without running the process out of memory,
//! then batched by time, size and count. A dedicated sender task performs the
//! bus writes so the run loop keeps draining while IO is in flight; each
//! successfully written batch advances the checkpointer with the batch's
//! highest position.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{Message, MessageWriter};
use crate::checkpoint::Checkpointer;
use crate::processor::Processor;
use crate::schemalog;
use crate::semaphore::{WeightedSemaphore, DEFAULT_MAX_QUEUE_BYTES};
use crate::wal;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_timeout: Duration,
    pub batch_bytes: i64,
    pub batch_size: usize,
    pub max_queue_bytes: Option<i64>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_secs(1),
            batch_bytes: 1_572_864,
            batch_size: 100,
            max_queue_bytes: None,
        }
    }
}

/// A queued unit: a serialized record, or a bare position for keep-alives.
struct Msg {
    msg: Option<Message>,
    pos: wal::CommitPosition,
}

impl Msg {
    fn size(&self) -> i64 {
        self.msg.as_ref().map_or(0, Message::size)
    }

    fn is_keep_alive(&self) -> bool {
        self.msg.is_none()
    }
}

#[derive(Default)]
struct MsgBatch {
    msgs: Vec<Message>,
    total_bytes: i64,
    last_pos: Option<wal::CommitPosition>,
}

impl MsgBatch {
    fn add(&mut self, msg: Msg) {
        let Msg { msg, pos } = msg;
        if let Some(m) = msg {
            self.total_bytes += m.size();
            self.msgs.push(m);
        }
        let advanced = match &self.last_pos {
            Some(last) => last.partial_cmp(&pos) != Some(Ordering::Greater),
            None => true,
        };
        if advanced {
            self.last_pos = Some(pos);
        }
    }

    fn drain(&mut self) -> MsgBatch {
        std::mem::take(self)
    }
}

pub struct BatchWriter {
    writer: Arc<dyn MessageWriter>,
    checkpointer: Option<Arc<dyn Checkpointer>>,

    // bounds the memory held by queued messages; acquired before a message
    // enters the channel, released once its batch has been handed to the bus
    queue_bytes_sema: WeightedSemaphore,
    msg_tx: Mutex<Option<mpsc::Sender<Msg>>>,
    msg_rx: Mutex<Option<mpsc::Receiver<Msg>>>,

    max_batch_bytes: i64,
    max_batch_size: usize,
    send_frequency: Duration,

    cancel: CancellationToken,
}

impl BatchWriter {
    pub fn new(
        config: WriterConfig,
        writer: Arc<dyn MessageWriter>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let max_queue_bytes = match config.max_queue_bytes {
            Some(bytes) if bytes < config.batch_bytes => {
                return Err(Error::Config(
                    "max queue bytes must be equal or bigger than the batch bytes".to_string(),
                ));
            }
            Some(bytes) => bytes,
            None => DEFAULT_MAX_QUEUE_BYTES,
        };

        let (msg_tx, msg_rx) = mpsc::channel(1);

        Ok(Self {
            writer,
            checkpointer,
            queue_bytes_sema: WeightedSemaphore::new(max_queue_bytes),
            msg_tx: Mutex::new(Some(msg_tx)),
            msg_rx: Mutex::new(Some(msg_rx)),
            max_batch_bytes: config.batch_bytes,
            max_batch_size: config.batch_size,
            send_frequency: config.batch_timeout,
            cancel,
        })
    }

    /// Drains and sends batches until cancellation, channel close, or a
    /// sender failure.
    pub async fn run(&self) -> Result<()> {
        let mut msg_rx = self
            .msg_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Replication {
                message: "batch writer run loop already started".to_string(),
            })?;

        // the bus writes happen on a separate task so this loop is always
        // draining; the semaphore and checkpointer move into the closure by
        // shared ownership, the batch channel by value
        let (batch_tx, mut batch_rx) = mpsc::channel::<MsgBatch>(1);
        let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);
        let writer = self.writer.clone();
        let checkpointer = self.checkpointer.clone();
        let sema = self.queue_bytes_sema.clone();
        let sender = tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                let result = send_batch(writer.as_ref(), checkpointer.as_deref(), &batch).await;
                sema.release(batch.total_bytes);
                if let Err(err) = result {
                    let _ = err_tx.send(err).await;
                    return;
                }
            }
        });

        let mut ticker = tokio::time::interval(self.send_frequency);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();

        let mut pending = MsgBatch::default();
        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // unsent bytes are returned here since the sender task
                    // will never see them
                    self.queue_bytes_sema.release(pending.total_bytes);
                    pending = MsgBatch::default();
                    break Err(Error::Shutdown);
                }
                Some(err) = err_rx.recv() => {
                    self.queue_bytes_sema.release(pending.total_bytes);
                    pending = MsgBatch::default();
                    break Err(err);
                }
                _ = ticker.tick() => {
                    let batch = pending.drain();
                    let bytes = batch.total_bytes;
                    if batch_tx.send(batch).await.is_err() {
                        self.queue_bytes_sema.release(bytes);
                        break Err(Error::Shutdown);
                    }
                }
                maybe_msg = msg_rx.recv() => match maybe_msg {
                    None => {
                        // input closed: flush what is left and exit cleanly
                        let batch = pending.drain();
                        let bytes = batch.total_bytes;
                        if batch_tx.send(batch).await.is_err() {
                            self.queue_bytes_sema.release(bytes);
                        }
                        break Ok(());
                    }
                    Some(msg) => {
                        if msg.is_keep_alive() {
                            // drained immediately so the checkpoint advances
                            // promptly during idle periods
                            pending.add(msg);
                            let batch = pending.drain();
                            let bytes = batch.total_bytes;
                            if batch_tx.send(batch).await.is_err() {
                                self.queue_bytes_sema.release(bytes);
                                break Err(Error::Shutdown);
                            }
                        } else {
                            if pending.total_bytes + msg.size() >= self.max_batch_bytes
                                || pending.msgs.len() == self.max_batch_size
                            {
                                let batch = pending.drain();
                                let bytes = batch.total_bytes;
                                if batch_tx.send(batch).await.is_err() {
                                    self.queue_bytes_sema.release(bytes + msg.size());
                                    break Err(Error::Shutdown);
                                }
                            }
                            pending.add(msg);
                        }
                    }
                },
            }
        };
        debug_assert!(pending.msgs.is_empty());

        // a message can still sit in the rendezvous channel when shutdown
        // wins the race; its bytes go back too
        msg_rx.close();
        while let Ok(msg) = msg_rx.try_recv() {
            self.queue_bytes_sema.release(msg.size());
        }

        drop(batch_tx);
        let _ = sender.await;

        // a send failure races the error channel against the next handoff;
        // the sender's own error wins over the bare shutdown sentinel
        match &result {
            Err(err) if !err.is_cancellation() => result,
            _ => match err_rx.try_recv() {
                Ok(err) => Err(err),
                Err(_) => result,
            },
        }
    }

    /// Closes the input channel and the underlying bus writer. The run loop
    /// flushes the remaining batch before exiting.
    pub async fn close(&self) -> Result<()> {
        self.msg_tx.lock().take();
        self.writer.close().await
    }

    #[cfg(test)]
    pub(crate) fn queue_bytes_in_use(&self) -> i64 {
        self.queue_bytes_sema.in_use()
    }

    /// Rendezvous-style handoff to the run loop: blocks until the message is
    /// taken or shutdown wins. The acquired bytes are returned if the
    /// message never makes it into the queue.
    async fn send_message(&self, msg: Msg) -> Result<()> {
        let tx = self
            .msg_tx
            .lock()
            .as_ref()
            .cloned()
            .ok_or(Error::Shutdown)?;
        let size = msg.size();
        tokio::select! {
            result = tx.send(msg) => result.map_err(|_| {
                self.queue_bytes_sema.release(size);
                Error::Shutdown
            }),
            _ = self.cancel.cancelled() => {
                self.queue_bytes_sema.release(size);
                Err(Error::Shutdown)
            }
        }
    }
}

/// Routing key for a WAL event. Ordinary events key on their schema; schema
/// log events key on the user schema they describe, extracted from the
/// `schema_name` column, so DDL lands on the same partition as the writes it
/// governs. A missing or mistyped column means the schema-log contract
/// changed under us and is an error.
pub(crate) fn message_key(data: &wal::Data) -> Result<Vec<u8>> {
    if !schemalog::is_schema_log_event(data) {
        return Ok(data.schema.as_bytes().to_vec());
    }

    let col = data
        .columns
        .iter()
        .find(|c| c.name == "schema_name")
        .ok_or_else(|| Error::InvalidMessage {
            message: "schema_log event with no schema_name column".to_string(),
        })?;
    let schema_name = col.value.as_str().ok_or_else(|| Error::InvalidMessage {
        message: format!(
            "schema_log schema_name is not a string: {:?}",
            col.value
        ),
    })?;
    Ok(schema_name.as_bytes().to_vec())
}

async fn send_batch(
    writer: &dyn MessageWriter,
    checkpointer: Option<&dyn Checkpointer>,
    batch: &MsgBatch,
) -> Result<()> {
    if !batch.msgs.is_empty() {
        debug!(
            size = batch.msgs.len(),
            pos = ?batch.last_pos,
            "sending message batch"
        );
        if let Err(err) = writer.write_messages(&batch.msgs).await {
            error!(error = %err, "failed to write to bus");
            return Err(err);
        }
    }

    // a batch of nothing but keep-alives still advances the checkpoint
    if let (Some(checkpointer), Some(pos)) = (checkpointer, &batch.last_pos) {
        if !pos.is_empty() {
            if let Err(err) = checkpointer.checkpoint(std::slice::from_ref(pos)).await {
                warn!(error = %err, "error updating commit position");
            }
        }
    }

    Ok(())
}

#[async_trait]
impl Processor for BatchWriter {
    fn name(&self) -> &'static str {
        "kafka_batch_writer"
    }

    async fn process_event(&self, event: wal::Event) -> Result<()> {
        let mut msg = Msg {
            msg: None,
            pos: event.commit_position,
        };

        if let Some(data) = &event.data {
            let value = serde_json::to_vec(data)?;
            // records larger than a batch can never be sent; drop rather
            // than wedge the stream
            if value.len() as i64 > self.max_batch_bytes {
                warn!(
                    size = value.len(),
                    max = self.max_batch_bytes,
                    schema = %data.schema,
                    table = %data.table,
                    "record too large, dropping"
                );
                return Ok(());
            }

            msg.msg = Some(Message {
                key: message_key(data)?,
                value,
            });
        }

        let size = msg.size();
        if !self.queue_bytes_sema.try_acquire(size) {
            warn!("max queue bytes reached, processing blocked");
            self.queue_bytes_sema.acquire(size, &self.cancel).await?;
        }

        self.send_message(msg).await
    }
}
