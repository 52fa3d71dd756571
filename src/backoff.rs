//! Retry schedules for transient failures.
//!
//! Components own their schedule through a [`Provider`] so tests can swap in
//! a zero-delay policy. Callers that combine a backoff sleep with shutdown
//! must race it against the cancellation token; cancellation wins.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// A retry schedule. `next_delay` returns the sleep before attempt
/// `attempt + 1`, or `None` once the budget is exhausted. Attempts are
/// zero-based: attempt 0 is the initial call.
pub trait Backoff: Send {
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    fn max_retries(&self) -> u32;
}

/// Factory handed to components so every retry loop starts from a fresh
/// schedule.
pub type Provider = Box<dyn Fn() -> Box<dyn Backoff> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_retries: u32,
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let delay = self
            .initial_interval
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(self.max_interval);
        Some(delay.min(self.max_interval))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantBackoff {
    pub interval: Duration,
    pub max_retries: u32,
}

impl Backoff for ConstantBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_retries).then_some(self.interval)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl ExponentialBackoff {
    pub fn provider(self) -> Provider {
        Box::new(move || Box::new(self.clone()) as Box<dyn Backoff>)
    }
}

impl ConstantBackoff {
    pub fn provider(self) -> Provider {
        Box::new(move || Box::new(self.clone()) as Box<dyn Backoff>)
    }
}

/// Runs `op` until it succeeds, the schedule is exhausted, or the token is
/// cancelled. The attempt counter passed to `op` is one-based, matching the
/// call count.
pub async fn retry<T, F, Fut>(
    backoff: &dyn Backoff,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt + 1).await {
            Ok(v) => return Ok(v),
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => match backoff.next_delay(attempt) {
                Some(delay) => {
                    debug!(attempt, ?delay, error = %err, "retrying after transient failure");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(Error::Shutdown),
                    }
                    attempt += 1;
                }
                None => return Err(Error::RetriesExhausted(Box::new(err))),
            },
        }
    }
}
