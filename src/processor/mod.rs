//! Processor contract shared by every sink.
//!
//! A processor receives events in listener emission order per (schema, table)
//! and owns their downstream fate: either a durable write that the
//! checkpointer can acknowledge, or a classified per-record failure.

use async_trait::async_trait;

use crate::wal;
use crate::Result;

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process_event(&self, event: wal::Event) -> Result<()>;
}

/// Hands each event to every sink in order. A sink failure stops the fan-out
/// so the event is not acknowledged past a failing sink.
pub struct Fanout {
    sinks: Vec<std::sync::Arc<dyn Processor>>,
}

impl Fanout {
    pub fn new(sinks: Vec<std::sync::Arc<dyn Processor>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Processor for Fanout {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn process_event(&self, event: wal::Event) -> Result<()> {
        for sink in &self.sinks {
            sink.process_event(event.clone()).await?;
        }
        Ok(())
    }
}
