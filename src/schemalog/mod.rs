//! Versioned table schemas captured from DDL.
//!
//! An external trigger appends an entry to the schema-log table on every DDL
//! change. Entries are append-only and identified by `(schema_name, version)`;
//! versions are monotonic per schema. The translator consults the log to
//! normalize event payloads to stable logical field names that survive
//! renames.

pub mod cache;
pub mod postgres;

pub use cache::CachedSchemaStore;
pub use postgres::PostgresSchemaStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::wal;
use crate::{Error, Result};

/// Schema the daemon's own bookkeeping tables live in.
pub const STREAM_SCHEMA: &str = "pgfanout";
pub const SCHEMA_LOG_TABLE: &str = "schema_log";

/// True when the event is a write into the schema-log table itself, meaning
/// it describes a DDL change rather than user data.
pub fn is_schema_log_event(data: &wal::Data) -> bool {
    data.schema == STREAM_SCHEMA && data.table == SCHEMA_LOG_TABLE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaLogEntry {
    #[serde(default)]
    pub id: i64,
    pub version: i64,
    pub schema_name: String,
    pub created_at: DateTime<Utc>,
    pub schema: Vec<TableSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub oid: u32,
    pub name: String,
    pub columns: Vec<SchemaColumn>,
    #[serde(default)]
    pub primary_key_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub id: i64,
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

impl TableSchema {
    pub fn column_by_name(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

impl SchemaColumn {
    /// Stable field name events are normalized to. Column ids survive
    /// renames, so downstream consumers see a consistent field across DDL.
    pub fn logical_name(&self) -> String {
        format!("col-{}", self.id)
    }
}

impl SchemaLogEntry {
    pub fn table_by_name(&self, name: &str) -> Option<&TableSchema> {
        self.schema.iter().find(|t| t.name == name)
    }

    /// Parses a schema-log row out of the WAL columns of an insert into the
    /// schema-log table.
    pub fn from_wal_data(data: &wal::Data) -> Result<Self> {
        let column = |name: &str| {
            data.columns
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| Error::MalformedSchemaLog(format!("missing column {name}")))
        };

        let id = column("id")?
            .value
            .as_i64()
            .ok_or_else(|| Error::MalformedSchemaLog("id is not an integer".to_string()))?;
        let version = column("version")?
            .value
            .as_i64()
            .ok_or_else(|| Error::MalformedSchemaLog("version is not an integer".to_string()))?;
        let schema_name = column("schema_name")?
            .value
            .as_str()
            .ok_or_else(|| Error::MalformedSchemaLog("schema_name is not a string".to_string()))?
            .to_string();

        let created_at = match &column("created_at")?.value {
            wal::ColumnValue::String(s) => parse_timestamp(s)?,
            wal::ColumnValue::Null => Utc::now(),
            other => {
                return Err(Error::MalformedSchemaLog(format!(
                    "created_at has unexpected type: {other:?}"
                )))
            }
        };

        let schema = match &column("schema")?.value {
            wal::ColumnValue::String(s) => serde_json::from_str(s)
                .map_err(|e| Error::MalformedSchemaLog(format!("schema payload: {e}")))?,
            wal::ColumnValue::Json(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::MalformedSchemaLog(format!("schema payload: {e}")))?,
            other => {
                return Err(Error::MalformedSchemaLog(format!(
                    "schema has unexpected type: {other:?}"
                )))
            }
        };

        Ok(SchemaLogEntry {
            id,
            version,
            schema_name,
            created_at,
            schema,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::MalformedSchemaLog(format!("created_at: {e}")))
}

/// Read/write access to the schema log.
///
/// `fetch`/`fetch_last` distinguish [`Error::SchemaLogNotFound`] from
/// transient store failures so callers can decide between falling back to an
/// unversioned payload and retrying.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn fetch(&self, schema_name: &str, version: i64) -> Result<SchemaLogEntry>;

    async fn fetch_last(&self, schema_name: &str) -> Result<SchemaLogEntry>;

    /// Idempotent on `(schema_name, version)`.
    async fn insert(&self, entry: &SchemaLogEntry) -> Result<()>;
}
