//! WAL event model.
//!
//! Events are produced by a listener, translated against the schema log, and
//! consumed exactly once by the configured processors. An event without data
//! is a keep-alive: it carries only a commit position to advance.

pub mod position;

pub use position::{CommitPosition, Lsn};

use serde::{Deserialize, Serialize};

/// A single unit of work flowing through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub data: Option<Data>,
    pub commit_position: CommitPosition,
}

impl Event {
    pub fn is_keep_alive(&self) -> bool {
        self.data.is_none()
    }
}

/// Row-change payload decoded from the replication stream.
///
/// `columns` preserves source order. For updates and deletes, `identity`
/// carries the replica-identity (primary key) column values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub action: Action,
    // begin/commit records carry no relation, so these default to empty
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity: Vec<Column>,
    #[serde(default)]
    pub lsn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Schema-log version the payload was normalized against. Zero when no
    /// schema log entry existed for the event's schema at translation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "I")]
    Insert,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
    #[serde(rename = "T")]
    Truncate,
    #[serde(rename = "B")]
    Begin,
    #[serde(rename = "C")]
    Commit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub value: ColumnValue,
    #[serde(default)]
    pub nullable: bool,
}

/// Tagged scalar carried by a column. Serialized as the plain JSON value so
/// payloads round-trip losslessly across the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl ColumnValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ColumnValue::Null => serde_json::Value::Null,
            ColumnValue::Bool(b) => serde_json::Value::Bool(*b),
            ColumnValue::Int(i) => serde_json::Value::from(*i),
            ColumnValue::Float(f) => serde_json::Value::from(*f),
            ColumnValue::String(s) => serde_json::Value::String(s.clone()),
            ColumnValue::Bytes(b) => {
                serde_json::Value::Array(b.iter().map(|v| serde_json::Value::from(*v)).collect())
            }
            ColumnValue::Json(v) => v.clone(),
        }
    }
}
