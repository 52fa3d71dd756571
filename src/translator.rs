//! Event translation against the schema log.
//!
//! The translator sits in front of the sinks and rewrites each event's
//! payload to reference a specific schema version, normalizing column names
//! to the stable logical names derived from the schema log. Events that are
//! themselves writes into the schema-log table are validated and forwarded
//! untouched, so sinks can act on the DDL change they describe.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backoff::{self, Provider};
use crate::processor::Processor;
use crate::schemalog::{self, SchemaLogEntry, SchemaStore};
use crate::wal;
use crate::{Error, Result};

pub struct Translator {
    inner: Arc<dyn Processor>,
    store: Arc<dyn SchemaStore>,
    backoff_provider: Provider,
    cancel: CancellationToken,
}

impl Translator {
    pub fn new(
        inner: Arc<dyn Processor>,
        store: Arc<dyn SchemaStore>,
        backoff_provider: Provider,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            store,
            backoff_provider,
            cancel,
        }
    }

    /// Fetches the latest schema-log entry, retrying transient store errors.
    /// Not-found is a stable answer, never retried.
    async fn fetch_last(&self, schema: &str) -> Result<Option<SchemaLogEntry>> {
        let schedule = (self.backoff_provider)();
        backoff::retry(schedule.as_ref(), &self.cancel, |_| async move {
            match self.store.fetch_last(schema).await {
                Ok(entry) => Ok(Some(entry)),
                Err(Error::SchemaLogNotFound) => Ok(None),
                Err(err) => Err(err),
            }
        })
        .await
    }

    fn translate(data: &mut wal::Data, entry: &SchemaLogEntry) {
        data.schema_version = Some(entry.version);

        let Some(table) = entry.table_by_name(&data.table) else {
            warn!(
                schema = %data.schema,
                table = %data.table,
                version = entry.version,
                "table missing from schema log entry, payload left unmapped"
            );
            return;
        };

        map_columns(&mut data.columns, table);
        map_columns(&mut data.identity, table);
    }
}

/// Renames columns to their logical names, dropping any the schema does not
/// know about.
fn map_columns(columns: &mut Vec<wal::Column>, table: &schemalog::TableSchema) {
    columns.retain_mut(|col| match table.column_by_name(&col.name) {
        Some(schema_col) => {
            col.name = schema_col.logical_name();
            true
        }
        None => false,
    });
}

#[async_trait]
impl Processor for Translator {
    fn name(&self) -> &'static str {
        "translator"
    }

    async fn process_event(&self, mut event: wal::Event) -> Result<()> {
        let Some(data) = event.data.as_mut() else {
            // keep-alive: nothing to translate
            return self.inner.process_event(event).await;
        };

        if schemalog::is_schema_log_event(data) {
            // validate the entry before letting it fan out; malformed entries
            // are terminal for this event
            SchemaLogEntry::from_wal_data(data)?;
            return self.inner.process_event(event).await;
        }

        let schema = data.schema.clone();
        match self.fetch_last(&schema).await? {
            Some(entry) => Self::translate(data, &entry),
            None => data.schema_version = Some(0),
        }

        self.inner.process_event(event).await
    }
}
