//! Weighted semaphore bounding the bytes admitted into work queues.
//!
//! The batch writer admits serialized payloads through this semaphore before
//! queueing them, so the process memory stays within budget under variable
//! message sizes. Blocked acquisition propagates backpressure all the way to
//! the replication stream.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub const DEFAULT_MAX_QUEUE_BYTES: i64 = 100 * 1024 * 1024; // 100MiB

#[derive(Clone)]
pub struct WeightedSemaphore {
    inner: Arc<Semaphore>,
    capacity: i64,
    outstanding: Arc<AtomicI64>,
}

impl WeightedSemaphore {
    pub fn new(capacity: i64) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            outstanding: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Non-blocking acquisition of `n` units.
    pub fn try_acquire(&self, n: i64) -> bool {
        if n > self.capacity {
            return false;
        }
        match self.inner.try_acquire_many(n as u32) {
            Ok(permit) => {
                permit.forget();
                self.outstanding.fetch_add(n, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    /// Blocks until `n` units are available or the token is cancelled.
    /// Requests larger than the total capacity fail deterministically.
    pub async fn acquire(&self, n: i64, cancel: &CancellationToken) -> Result<()> {
        if n > self.capacity {
            return Err(Error::RequestTooLarge);
        }
        tokio::select! {
            permit = self.inner.acquire_many(n as u32) => {
                let permit = permit.map_err(|_| Error::Shutdown)?;
                permit.forget();
                self.outstanding.fetch_add(n, Ordering::AcqRel);
                Ok(())
            }
            _ = cancel.cancelled() => Err(Error::Shutdown),
        }
    }

    /// Returns `n` units to the semaphore. Each accepted acquisition must be
    /// released exactly once; releasing more than was acquired is a
    /// programming error.
    pub fn release(&self, n: i64) {
        let prev = self.outstanding.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "semaphore release without matching acquire");
        self.inner.add_permits(n as usize);
    }

    /// Units currently held by in-flight work.
    pub fn in_use(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }
}
