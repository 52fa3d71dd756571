//! Replication listener: turns the raw replication stream into WAL events.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::invoke_processor;
use crate::processor::Processor;
use crate::replication;
use crate::wal;
use crate::{Error, Result};

pub struct Listener {
    handler: Arc<dyn replication::Handler>,
    processor: Arc<dyn Processor>,
    cancel: CancellationToken,
}

impl Listener {
    pub fn new(
        handler: Arc<dyn replication::Handler>,
        processor: Arc<dyn Processor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handler,
            processor,
            cancel,
        }
    }

    /// Blocks until cancellation or a fatal error, handing every message to
    /// the processor in stream order.
    pub async fn listen(&self) -> Result<()> {
        self.handler.start().await?;
        debug!("replication started");

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Shutdown),
                received = self.handler.receive_message() => received,
            };

            let msg = match received {
                Ok(msg) => msg,
                // read deadlines are routine on an idle stream
                Err(Error::ConnTimeout) => continue,
                Err(err) => return Err(err),
            };

            trace!(lsn = %msg.lsn, keep_alive = msg.data.is_none(), "received replication message");
            self.process_message(msg).await?;
        }
    }

    async fn process_message(&self, msg: replication::Message) -> Result<()> {
        if msg.reply_requested {
            let confirmed = self.handler.confirmed_lsn();
            debug!(lsn = %confirmed, "reply requested, syncing confirmed position");
            self.handler.sync_lsn(confirmed).await?;
        }

        let event = match &msg.data {
            None => {
                if msg.lsn.is_zero() {
                    return Ok(());
                }
                wal::Event {
                    data: None,
                    commit_position: wal::CommitPosition::wal(msg.lsn),
                }
            }
            Some(bytes) => {
                // a payload that no longer deserializes means the decoder
                // contract changed; that is fatal, not a per-record drop
                let data: wal::Data = serde_json::from_slice(bytes)?;
                wal::Event {
                    data: Some(data),
                    commit_position: wal::CommitPosition::wal(msg.lsn),
                }
            }
        };

        if let Err(err) = invoke_processor(self.processor.as_ref(), event).await {
            if err.is_cancellation() {
                return Err(err);
            }
            error!(
                severity = "DATALOSS",
                error = %err,
                lsn = %msg.lsn,
                "processing replication event"
            );
        }

        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.handler.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::mocks::MockProcessor;
    use crate::replication::mocks::MockHandler;
    use crate::replication::Message;
    use crate::wal::{Action, CommitPosition, Lsn};
    use bytes::Bytes;
    use std::time::Duration;

    fn wal_payload() -> Bytes {
        let data = wal::Data {
            action: Action::Insert,
            schema: "public".to_string(),
            table: "users".to_string(),
            columns: vec![],
            identity: vec![],
            lsn: "0/10".to_string(),
            timestamp: None,
            schema_version: None,
        };
        Bytes::from(serde_json::to_vec(&data).unwrap())
    }

    fn data_message(lsn: u64) -> Message {
        Message {
            lsn: Lsn(lsn),
            data: Some(wal_payload()),
            server_time: None,
            reply_requested: false,
        }
    }

    async fn run_until_cancelled(listener: &Listener, cancel: &CancellationToken) -> Result<()> {
        let deadline = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(deadline);
        tokio::select! {
            result = listener.listen() => result,
            _ = &mut deadline => {
                cancel.cancel();
                Err(Error::Timeout { message: "test deadline".to_string() })
            }
        }
    }

    fn listener_with(
        handler: MockHandler,
    ) -> (Listener, Arc<MockHandler>, Arc<MockProcessor>, CancellationToken) {
        let handler = Arc::new(handler);
        let processor = Arc::new(MockProcessor::new());
        let cancel = CancellationToken::new();
        let listener = Listener::new(handler.clone(), processor.clone(), cancel.clone());
        (listener, handler, processor, cancel)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_message_received_and_processed() {
        let handler = MockHandler::new(Box::new(|call| match call {
            1 => Ok(data_message(0x10)),
            _ => Err(Error::ConnTimeout),
        }));
        let (listener, _handler, processor, cancel) = listener_with(handler);

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel2.cancel();
        });

        let result = run_until_cancelled(&listener, &cancel).await;
        assert!(matches!(result, Err(Error::Shutdown)));

        let events = processor.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].commit_position, CommitPosition::wal(Lsn(0x10)));
        assert!(events[0].data.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conn_timeout_retried_without_surfacing() {
        let handler = MockHandler::new(Box::new(|call| match call {
            1 => Err(Error::ConnTimeout),
            2 => Ok(data_message(0x20)),
            _ => Err(Error::ConnTimeout),
        }));
        let (listener, _handler, processor, cancel) = listener_with(handler);

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel2.cancel();
        });

        let result = run_until_cancelled(&listener, &cancel).await;
        assert!(matches!(result, Err(Error::Shutdown)));

        // exactly one event, from the post-timeout message
        let events = processor.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].commit_position, CommitPosition::wal(Lsn(0x20)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_keep_alive_emitted_with_position_only() {
        let handler = MockHandler::new(Box::new(|call| match call {
            1 => Ok(Message {
                lsn: Lsn(0x30),
                data: None,
                server_time: None,
                reply_requested: false,
            }),
            _ => Err(Error::ConnTimeout),
        }));
        let (listener, _handler, processor, cancel) = listener_with(handler);

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel2.cancel();
        });

        let _ = run_until_cancelled(&listener, &cancel).await;

        let events = processor.events.lock();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_keep_alive());
        assert_eq!(events[0].commit_position, CommitPosition::wal(Lsn(0x30)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reply_requested_syncs_confirmed_position() {
        let handler = MockHandler::new(Box::new(|call| match call {
            1 => Ok(Message {
                lsn: Lsn(0x40),
                data: None,
                server_time: None,
                reply_requested: true,
            }),
            _ => Err(Error::ConnTimeout),
        }));
        let (listener, handler, _processor, cancel) = listener_with(handler);

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel2.cancel();
        });

        let _ = run_until_cancelled(&listener, &cancel).await;
        // confirmed position starts at zero; the reply still goes out
        assert_eq!(*handler.synced.lock(), vec![Lsn(0)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_receive_error_is_fatal() {
        let handler = MockHandler::new(Box::new(|_| {
            Err(Error::Connection("stream broken".to_string()))
        }));
        let (listener, _handler, _processor, cancel) = listener_with(handler);

        let result = run_until_cancelled(&listener, &cancel).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_processor_error_logged_not_fatal() {
        let handler = MockHandler::new(Box::new(|call| match call {
            1 => Ok(data_message(0x50)),
            _ => Err(Error::ConnTimeout),
        }));
        let mut processor = MockProcessor::new();
        processor.fail_with = Some(|| Error::Connection("sink hiccup".to_string()));
        let cancel = CancellationToken::new();
        let listener = Listener::new(
            Arc::new(handler),
            Arc::new(processor),
            cancel.clone(),
        );

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel2.cancel();
        });

        // the processor failure is absorbed; only cancellation surfaces
        let result = run_until_cancelled(&listener, &cancel).await;
        assert!(matches!(result, Err(Error::Shutdown)));
    }
}
