//! Listeners produce the pipeline's event stream.
//!
//! A listener blocks in `listen` until cancellation or a fatal error,
//! invoking the processor callback once per event. Per-record processor
//! failures are logged with DATALOSS severity and acknowledged so a single
//! bad record cannot halt the stream; only cancellation propagates upward.

pub mod postgres;

pub use postgres::Listener;

use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::error;

use crate::processor::Processor;
use crate::wal;
use crate::{Error, Result};

/// Invokes the processor, converting panics into errors. The stack trace is
/// logged at the recovery site since it is lost once the payload is turned
/// into an [`Error`].
pub(crate) async fn invoke_processor(processor: &dyn Processor, event: wal::Event) -> Result<()> {
    match AssertUnwindSafe(processor.process_event(event))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            error!(
                panic = %message,
                stack_trace = %Backtrace::force_capture(),
                "[PANIC] Panic while processing replication event"
            );
            Err(Error::ProcessorPanic(message))
        }
    }
}
