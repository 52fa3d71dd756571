//! Shared mock collaborators for the integration tests. Everything here
//! implements the public trait boundaries, so the tests exercise the real
//! wiring with no live services.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use pg_fanout::checkpoint::Checkpointer;
use pg_fanout::kafka::{Message, MessageWriter};
use pg_fanout::replication::{Handler, Message as ReplicationMessage};
use pg_fanout::schemalog::{SchemaLogEntry, SchemaStore};
use pg_fanout::search::{Document, DocumentError, SearchStore};
use pg_fanout::wal::{self, CommitPosition, Lsn};
use pg_fanout::{Error, Result};

pub type ReceiveFn = Box<dyn Fn(u64) -> Result<ReplicationMessage> + Send + Sync>;

/// Replication handler scripted per receive call (one-based counter).
pub struct ScriptedHandler {
    receive_fn: ReceiveFn,
    calls: AtomicU64,
    confirmed: AtomicU64,
    pub synced: Mutex<Vec<Lsn>>,
}

impl ScriptedHandler {
    pub fn new(receive_fn: ReceiveFn) -> Arc<Self> {
        Arc::new(Self {
            receive_fn,
            calls: AtomicU64::new(0),
            confirmed: AtomicU64::new(0),
            synced: Mutex::new(Vec::new()),
        })
    }

    pub fn receive_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn receive_message(&self) -> Result<ReplicationMessage> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.receive_fn)(call)
    }

    async fn sync_lsn(&self, lsn: Lsn) -> Result<()> {
        self.confirmed.fetch_max(lsn.0, Ordering::SeqCst);
        self.synced.lock().push(lsn);
        Ok(())
    }

    fn confirmed_lsn(&self) -> Lsn {
        Lsn(self.confirmed.load(Ordering::SeqCst))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Bus writer capturing every batch.
#[derive(Default)]
pub struct CapturingBusWriter {
    pub batches: Mutex<Vec<Vec<Message>>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl CapturingBusWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.batches.lock().concat()
    }
}

#[async_trait]
impl MessageWriter for CapturingBusWriter {
    async fn write_messages(&self, msgs: &[Message]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Connection("bus unavailable".to_string()));
        }
        self.batches.lock().push(msgs.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory schema log keyed by schema name.
#[derive(Default)]
pub struct InMemorySchemaStore {
    entries: Mutex<Vec<SchemaLogEntry>>,
}

impl InMemorySchemaStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_entries(entries: Vec<SchemaLogEntry>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(entries),
        })
    }
}

#[async_trait]
impl SchemaStore for InMemorySchemaStore {
    async fn fetch(&self, schema_name: &str, version: i64) -> Result<SchemaLogEntry> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.schema_name == schema_name && e.version == version)
            .cloned()
            .ok_or(Error::SchemaLogNotFound)
    }

    async fn fetch_last(&self, schema_name: &str) -> Result<SchemaLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.schema_name == schema_name)
            .max_by_key(|e| e.version)
            .cloned()
            .ok_or(Error::SchemaLogNotFound)
    }

    async fn insert(&self, entry: &SchemaLogEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        let exists = entries
            .iter()
            .any(|e| e.schema_name == entry.schema_name && e.version == entry.version);
        if !exists {
            entries.push(entry.clone());
        }
        Ok(())
    }
}

/// Search store capturing bulk submissions and index lifecycle calls.
#[derive(Default)]
pub struct CapturingSearchStore {
    pub batches: Mutex<Vec<Vec<Document>>>,
    pub indices: Mutex<Vec<(String, i64)>>,
    pub aliases: Mutex<Vec<(String, i64)>>,
}

impl CapturingSearchStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SearchStore for CapturingSearchStore {
    async fn send_documents(
        &self,
        _attempt: u32,
        docs: Vec<Document>,
    ) -> Result<Vec<DocumentError>> {
        self.batches.lock().push(docs);
        Ok(vec![])
    }

    async fn ensure_index(&self, schema: &str, version: i64) -> Result<()> {
        self.indices.lock().push((schema.to_string(), version));
        Ok(())
    }

    async fn alias(&self, schema: &str, version: i64) -> Result<()> {
        self.aliases.lock().push((schema.to_string(), version));
        Ok(())
    }
}

/// Checkpointer recording every call.
#[derive(Default)]
pub struct RecordingCheckpointer {
    pub calls: Mutex<Vec<Vec<CommitPosition>>>,
}

impl RecordingCheckpointer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Checkpointer for RecordingCheckpointer {
    async fn checkpoint(&self, positions: &[CommitPosition]) -> Result<()> {
        self.calls.lock().push(positions.to_vec());
        Ok(())
    }
}

pub fn wal_data(schema: &str, table: &str, id: i64, lsn: u64) -> wal::Data {
    wal::Data {
        action: wal::Action::Insert,
        schema: schema.to_string(),
        table: table.to_string(),
        columns: vec![wal::Column {
            name: "id".to_string(),
            typ: "int8".to_string(),
            value: wal::ColumnValue::Int(id),
            nullable: false,
        }],
        identity: vec![],
        lsn: Lsn(lsn).to_string(),
        timestamp: None,
        schema_version: None,
    }
}

pub fn data_message(data: &wal::Data, lsn: u64) -> ReplicationMessage {
    ReplicationMessage {
        lsn: Lsn(lsn),
        data: Some(bytes::Bytes::from(serde_json::to_vec(data).unwrap())),
        server_time: None,
        reply_requested: false,
    }
}

pub fn keep_alive_message(lsn: u64) -> ReplicationMessage {
    ReplicationMessage {
        lsn: Lsn(lsn),
        data: None,
        server_time: None,
        reply_requested: false,
    }
}
