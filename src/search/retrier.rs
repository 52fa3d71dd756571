//! Retrying wrapper around the search store.
//!
//! Transport failures retry the whole batch; per-document failures are
//! partitioned by severity so data-loss errors are never re-sent while
//! retriable ones shrink the working set each round. The final report lists
//! the retriable leftovers first, then the accumulated data-loss errors.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Document, DocumentError, SearchStore, Severity};
use crate::backoff::Provider;
use crate::{Error, Result};

pub struct StoreRetrier {
    inner: Arc<dyn SearchStore>,
    backoff_provider: Provider,
    cancel: CancellationToken,
}

impl StoreRetrier {
    pub fn new(
        inner: Arc<dyn SearchStore>,
        backoff_provider: Provider,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            backoff_provider,
            cancel,
        }
    }

    /// Sends the batch, retrying within the backoff budget. The returned
    /// list holds the documents that were dropped: still-retriable leftovers
    /// when the budget ran out, plus every data-loss failure seen on the way.
    pub async fn send_documents(&self, docs: Vec<Document>) -> Result<Vec<DocumentError>> {
        let schedule = (self.backoff_provider)();
        let mut attempt = 0u32;
        let mut call = 0u32;
        let mut to_send = docs;
        let mut dataloss: Vec<DocumentError> = Vec::new();

        loop {
            call += 1;
            let failed = match self.inner.send_documents(call, to_send.clone()).await {
                Ok(failed) => failed,
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    // transport failure: the whole batch is retried
                    match schedule.next_delay(attempt) {
                        Some(delay) => {
                            warn!(error = %err, "search store send failed, retrying batch");
                            self.sleep(delay).await?;
                            attempt += 1;
                            continue;
                        }
                        None => return Err(err),
                    }
                }
            };

            if failed.is_empty() {
                return Ok(Vec::new());
            }

            let mut retriable = Vec::new();
            for doc_err in failed {
                match doc_err.severity {
                    Severity::DataLoss => dataloss.push(doc_err),
                    Severity::Retriable => retriable.push(doc_err),
                }
            }

            if retriable.is_empty() {
                return Ok(dataloss);
            }

            to_send = retriable.iter().map(|e| e.document.clone()).collect();
            match schedule.next_delay(attempt) {
                Some(delay) => {
                    debug!(
                        remaining = to_send.len(),
                        "resending retriable documents"
                    );
                    self.sleep(delay).await?;
                    attempt += 1;
                }
                None => {
                    retriable.extend(dataloss);
                    return Ok(retriable);
                }
            }
        }
    }

    async fn sleep(&self, delay: std::time::Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(Error::Shutdown),
        }
    }
}
