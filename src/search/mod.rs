//! Search sink: documents, failure classification, and the store boundary.

pub mod indexer;
pub mod opensearch;
pub mod retrier;

pub use indexer::{Indexer, IndexerConfig};
pub use opensearch::OpenSearchStore;
pub use retrier::StoreRetrier;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::wal;
use crate::Result;

/// A document upsert or delete bound for the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub schema: String,
    pub version: i64,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub delete: bool,
}

/// How a per-document failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Unrecoverable for this document: drop it, log it, move on.
    DataLoss,
    /// Worth resubmitting within the retry budget.
    Retriable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentError {
    pub document: Document,
    pub severity: Severity,
    pub error: String,
}

/// Bulk document submission plus index lifecycle for schema versions.
#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Submits the documents, returning per-document failures. A transport
    /// level failure is returned as `Err` and fails the whole batch.
    /// `attempt` is the one-based call count within the current retry cycle.
    async fn send_documents(&self, attempt: u32, docs: Vec<Document>) -> Result<Vec<DocumentError>>;

    /// Creates the index backing `(schema, version)` if it does not exist.
    async fn ensure_index(&self, schema: &str, version: i64) -> Result<()>;

    /// Points the schema's read alias at the given version.
    async fn alias(&self, schema: &str, version: i64) -> Result<()>;
}

/// Maps a row-change event to a document. Returns `None` for actions with no
/// document representation (begin/commit/truncate markers).
pub fn document_from_event(data: &wal::Data) -> Option<Document> {
    let delete = match data.action {
        wal::Action::Insert | wal::Action::Update => false,
        wal::Action::Delete => true,
        _ => return None,
    };

    // deletes identify the row through the replica identity columns
    let id_columns = if delete && !data.identity.is_empty() {
        &data.identity
    } else {
        &data.columns
    };
    let key = id_columns
        .first()
        .map(|col| json_value_string(&col.value.to_json()))?;

    let mut doc_data = serde_json::Map::new();
    if !delete {
        for col in &data.columns {
            doc_data.insert(col.name.clone(), col.value.to_json());
        }
    }

    Some(Document {
        id: format!("{}.{}.{}", data.schema, data.table, key),
        schema: data.schema.clone(),
        version: data.schema_version.unwrap_or(0),
        data: doc_data,
        delete,
    })
}

fn json_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
