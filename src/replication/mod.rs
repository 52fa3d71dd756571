//! Replication protocol handler contract.
//!
//! The handler hides the raw logical replication client: it yields decoded
//! WAL messages and accepts LSN acknowledgements. Connection-level timeouts
//! surface as the dedicated [`Error::ConnTimeout`] sentinel, which listeners
//! retry transparently.

pub mod postgres;

pub use postgres::PostgresReplicationHandler;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::wal::Lsn;
use crate::Result;

/// A single message received off the replication stream. `data` is `None`
/// for primary keep-alives, which carry only a position to acknowledge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub lsn: Lsn,
    pub data: Option<Bytes>,
    pub server_time: Option<DateTime<Utc>>,
    pub reply_requested: bool,
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Starts replication from the last confirmed position.
    async fn start(&self) -> Result<()>;

    /// Blocks until the next message arrives. Returns
    /// [`Error::ConnTimeout`](crate::Error::ConnTimeout) when the connection
    /// read deadline passes without data.
    async fn receive_message(&self) -> Result<Message>;

    /// Acknowledges `lsn` to the source, advancing its confirmed flush
    /// position. Positions at or below the current confirmed position are
    /// accepted and ignored.
    async fn sync_lsn(&self, lsn: Lsn) -> Result<()>;

    /// The highest LSN acknowledged so far.
    fn confirmed_lsn(&self) -> Lsn;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mocks {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    type ReceiveFn = Box<dyn Fn(u64) -> Result<Message> + Send + Sync>;

    /// Scripted handler: `receive_fn` is handed a one-based call counter so
    /// tests can stage per-call behavior.
    pub struct MockHandler {
        pub receive_fn: ReceiveFn,
        calls: AtomicU64,
        confirmed: AtomicU64,
        pub synced: Mutex<Vec<Lsn>>,
    }

    impl MockHandler {
        pub fn new(receive_fn: ReceiveFn) -> Self {
            Self {
                receive_fn,
                calls: AtomicU64::new(0),
                confirmed: AtomicU64::new(0),
                synced: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Handler for MockHandler {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn receive_message(&self) -> Result<Message> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.receive_fn)(call)
        }

        async fn sync_lsn(&self, lsn: Lsn) -> Result<()> {
            self.confirmed.fetch_max(lsn.0, Ordering::SeqCst);
            self.synced.lock().push(lsn);
            Ok(())
        }

        fn confirmed_lsn(&self) -> Lsn {
            Lsn(self.confirmed.load(Ordering::SeqCst))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }
}
