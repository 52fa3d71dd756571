//! Schema-log store backed by the source database.

use async_trait::async_trait;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{error, info};

use super::{SchemaLogEntry, SchemaStore, TableSchema};
use crate::{Error, Result};

const CREATE_SCHEMA: &str = "CREATE SCHEMA IF NOT EXISTS pgfanout";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS pgfanout.schema_log (
    id BIGSERIAL PRIMARY KEY,
    version BIGINT NOT NULL,
    schema_name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    schema JSONB NOT NULL,
    UNIQUE (schema_name, version)
)";

pub struct PostgresSchemaStore {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PostgresSchemaStore {
    pub async fn new(url: &str) -> Result<Self> {
        let config = url.parse::<PgConfig>()?;
        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Schema log store connection error: {}", e);
            }
        });

        let store = Self {
            client,
            connection_task,
        };
        store.ensure_table().await?;
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<()> {
        self.client.batch_execute(CREATE_SCHEMA).await?;
        self.client.batch_execute(CREATE_TABLE).await?;
        info!("Schema log table ready");
        Ok(())
    }

    pub fn close(self) {
        self.connection_task.abort();
    }

    fn entry_from_row(row: &tokio_postgres::Row) -> Result<SchemaLogEntry> {
        let schema: serde_json::Value = row.get("schema");
        let tables: Vec<TableSchema> = serde_json::from_value(schema)
            .map_err(|e| Error::MalformedSchemaLog(format!("stored schema payload: {e}")))?;

        Ok(SchemaLogEntry {
            id: row.get("id"),
            version: row.get("version"),
            schema_name: row.get("schema_name"),
            created_at: row.get("created_at"),
            schema: tables,
        })
    }
}

#[async_trait]
impl SchemaStore for PostgresSchemaStore {
    async fn fetch(&self, schema_name: &str, version: i64) -> Result<SchemaLogEntry> {
        let row = self
            .client
            .query_opt(
                "SELECT id, version, schema_name, created_at, schema
                 FROM pgfanout.schema_log
                 WHERE schema_name = $1 AND version = $2",
                &[&schema_name, &version],
            )
            .await?;

        match row {
            Some(row) => Self::entry_from_row(&row),
            None => Err(Error::SchemaLogNotFound),
        }
    }

    async fn fetch_last(&self, schema_name: &str) -> Result<SchemaLogEntry> {
        let row = self
            .client
            .query_opt(
                "SELECT id, version, schema_name, created_at, schema
                 FROM pgfanout.schema_log
                 WHERE schema_name = $1
                 ORDER BY version DESC
                 LIMIT 1",
                &[&schema_name],
            )
            .await?;

        match row {
            Some(row) => Self::entry_from_row(&row),
            None => Err(Error::SchemaLogNotFound),
        }
    }

    async fn insert(&self, entry: &SchemaLogEntry) -> Result<()> {
        let schema = serde_json::to_value(&entry.schema)?;
        self.client
            .execute(
                "INSERT INTO pgfanout.schema_log (version, schema_name, created_at, schema)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (schema_name, version) DO NOTHING",
                &[&entry.version, &entry.schema_name, &entry.created_at, &schema],
            )
            .await?;
        Ok(())
    }
}
