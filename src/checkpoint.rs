//! Checkpointers tie replication progress to downstream delivery.
//!
//! A checkpoint is only ever issued for positions whose payloads have been
//! durably accepted downstream; for every checkpoint call sequence the
//! committed position is non-decreasing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backoff::{self, Provider};
use crate::replication;
use crate::wal::CommitPosition;
use crate::Result;

#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(&self, positions: &[CommitPosition]) -> Result<()>;
}

/// Advances the upstream confirmed flush position by acknowledging the
/// highest WAL LSN in the batch to the replication handler.
pub struct ReplicationCheckpointer {
    handler: Arc<dyn replication::Handler>,
}

impl ReplicationCheckpointer {
    pub fn new(handler: Arc<dyn replication::Handler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl Checkpointer for ReplicationCheckpointer {
    async fn checkpoint(&self, positions: &[CommitPosition]) -> Result<()> {
        let max = positions
            .iter()
            .filter_map(CommitPosition::as_lsn)
            .filter(|lsn| !lsn.is_zero())
            .max();

        if let Some(lsn) = max {
            debug!(%lsn, "syncing LSN");
            self.handler.sync_lsn(lsn).await?;
        }
        Ok(())
    }
}

/// A consumer-group offset commit target; implemented by the bus reader.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    async fn commit_offsets(&self, offsets: &[(String, i32, i64)]) -> Result<()>;
}

/// Commits the highest offset per (topic, partition) back to the consumer
/// group. Transient commit failures are retried under the commit backoff;
/// exhausted retries surface as fatal and tear the pipeline down.
pub struct BusCheckpointer {
    committer: Arc<dyn OffsetCommitter>,
    backoff_provider: Provider,
    cancel: CancellationToken,
}

impl BusCheckpointer {
    pub fn new(
        committer: Arc<dyn OffsetCommitter>,
        backoff_provider: Provider,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            committer,
            backoff_provider,
            cancel,
        }
    }
}

#[async_trait]
impl Checkpointer for BusCheckpointer {
    async fn checkpoint(&self, positions: &[CommitPosition]) -> Result<()> {
        // positions from different partitions are incomparable: fold to the
        // highest offset per partition rather than a single position
        let mut highest: HashMap<(String, i32), i64> = HashMap::new();
        for pos in positions {
            if let CommitPosition::Bus {
                topic,
                partition,
                offset,
            } = pos
            {
                highest
                    .entry((topic.clone(), *partition))
                    .and_modify(|o| *o = (*o).max(*offset))
                    .or_insert(*offset);
            }
        }

        if highest.is_empty() {
            return Ok(());
        }

        let offsets: Vec<(String, i32, i64)> = highest
            .into_iter()
            .map(|((topic, partition), offset)| (topic, partition, offset))
            .collect();

        let schedule = (self.backoff_provider)();
        let offsets = &offsets;
        backoff::retry(schedule.as_ref(), &self.cancel, |_| async move {
            self.committer.commit_offsets(offsets).await
        })
        .await
    }
}
