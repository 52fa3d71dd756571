//! OpenSearch-compatible store adapter speaking the bulk and alias APIs.
//!
//! Each schema version is backed by its own index (`<schema>-v<version>`)
//! with the bare schema name as a read alias, so a schema change rotates the
//! alias instead of reindexing in place.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{Document, DocumentError, SearchStore, Severity};
use crate::{Error, Result};

pub struct OpenSearchStore {
    client: reqwest::Client,
    base_url: String,
}

impl OpenSearchStore {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: url.trim_end_matches('/').to_string(),
        }
    }

    fn index_name(schema: &str, version: i64) -> String {
        format!("{schema}-v{version}")
    }

    fn bulk_body(docs: &[Document]) -> Result<String> {
        let mut body = String::new();
        for doc in docs {
            let index = Self::index_name(&doc.schema, doc.version);
            if doc.delete {
                let action = json!({"delete": {"_index": index, "_id": doc.id}});
                body.push_str(&serde_json::to_string(&action)?);
                body.push('\n');
            } else {
                let action = json!({"index": {"_index": index, "_id": doc.id}});
                body.push_str(&serde_json::to_string(&action)?);
                body.push('\n');
                body.push_str(&serde_json::to_string(&doc.data)?);
                body.push('\n');
            }
        }
        Ok(body)
    }
}

#[derive(Deserialize)]
struct BulkResponse {
    errors: bool,
    items: Vec<serde_json::Value>,
}

/// Bulk item statuses that are worth resubmitting: throttling and server
/// side failures. Everything else that failed is a malformed document.
fn severity_for_status(status: u64) -> Severity {
    if status == 429 || status >= 500 {
        Severity::Retriable
    } else {
        Severity::DataLoss
    }
}

#[async_trait]
impl SearchStore for OpenSearchStore {
    async fn send_documents(&self, attempt: u32, docs: Vec<Document>) -> Result<Vec<DocumentError>> {
        if docs.is_empty() {
            return Ok(vec![]);
        }
        debug!(attempt, count = docs.len(), "bulk indexing documents");

        let body = Self::bulk_body(&docs)?;
        let response = self
            .client
            .post(format!("{}/_bulk", self.base_url))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Connection(format!(
                "bulk request failed with status {}",
                response.status()
            )));
        }

        let bulk: BulkResponse = response
            .json()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        if !bulk.errors {
            return Ok(vec![]);
        }

        // items come back in request order, one per document
        let mut failed = Vec::new();
        for (doc, item) in docs.into_iter().zip(bulk.items) {
            let result = item
                .get("index")
                .or_else(|| item.get("delete"))
                .cloned()
                .unwrap_or_default();
            let status = result.get("status").and_then(|s| s.as_u64()).unwrap_or(0);
            if let Some(error) = result.get("error") {
                failed.push(DocumentError {
                    document: doc,
                    severity: severity_for_status(status),
                    error: error.to_string(),
                });
            }
        }
        Ok(failed)
    }

    async fn ensure_index(&self, schema: &str, version: i64) -> Result<()> {
        let index = Self::index_name(schema, version);
        let response = self
            .client
            .put(format!("{}/{}", self.base_url, index))
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        if response.status().is_success() {
            info!(%index, "created search index");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        if body.contains("resource_already_exists_exception") {
            debug!(%index, "search index already exists");
            return Ok(());
        }
        Err(Error::Connection(format!(
            "creating index {index}: {body}"
        )))
    }

    async fn alias(&self, schema: &str, version: i64) -> Result<()> {
        let index = Self::index_name(schema, version);
        // swap atomically so the alias only ever resolves to one version
        let swap = json!({
            "actions": [
                {"remove": {"index": format!("{schema}-v*"), "alias": schema}},
                {"add": {"index": index, "alias": schema}}
            ]
        });
        let add_only = json!({
            "actions": [
                {"add": {"index": index, "alias": schema}}
            ]
        });

        for actions in [&swap, &add_only] {
            let response = self
                .client
                .post(format!("{}/_aliases", self.base_url))
                .json(actions)
                .send()
                .await
                .map_err(|e| Error::Connection(e.to_string()))?;
            if response.status().is_success() {
                info!(%index, alias = %schema, "search alias updated");
                return Ok(());
            }
        }
        Err(Error::Connection(format!(
            "updating alias {schema} -> {index} failed"
        )))
    }
}
