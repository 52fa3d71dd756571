//! In-process cache fronting the schema-log store.
//!
//! The translator hits the schema log on every event, so the latest entry per
//! schema is kept in memory and refreshed on a TTL. Misses fall through to
//! the store; negative results are not cached, since the schema log may be
//! populated at any moment by the DDL trigger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::{SchemaLogEntry, SchemaStore};
use crate::Result;

pub const DEFAULT_CACHE_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

struct CachedEntry {
    entry: SchemaLogEntry,
    fetched_at: Instant,
}

pub struct CachedSchemaStore {
    inner: Arc<dyn SchemaStore>,
    refresh_interval: Duration,
    entries: RwLock<HashMap<String, CachedEntry>>,
}

impl CachedSchemaStore {
    pub fn new(inner: Arc<dyn SchemaStore>, refresh_interval: Duration) -> Self {
        Self {
            inner,
            refresh_interval,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the cached entry for a schema unless it would move the
    /// version backwards. Versions observed per schema are monotonically
    /// non-decreasing.
    fn store_entry(&self, entry: SchemaLogEntry) {
        let mut entries = self.entries.write();
        match entries.get(&entry.schema_name) {
            Some(cached) if cached.entry.version > entry.version => {}
            _ => {
                entries.insert(
                    entry.schema_name.clone(),
                    CachedEntry {
                        entry,
                        fetched_at: Instant::now(),
                    },
                );
            }
        }
    }
}

#[async_trait]
impl SchemaStore for CachedSchemaStore {
    async fn fetch(&self, schema_name: &str, version: i64) -> Result<SchemaLogEntry> {
        {
            let entries = self.entries.read();
            if let Some(cached) = entries.get(schema_name) {
                if cached.entry.version == version {
                    return Ok(cached.entry.clone());
                }
            }
        }
        self.inner.fetch(schema_name, version).await
    }

    async fn fetch_last(&self, schema_name: &str) -> Result<SchemaLogEntry> {
        {
            let entries = self.entries.read();
            if let Some(cached) = entries.get(schema_name) {
                if cached.fetched_at.elapsed() < self.refresh_interval {
                    trace!(schema = schema_name, version = cached.entry.version, "schema log cache hit");
                    return Ok(cached.entry.clone());
                }
            }
        }

        let entry = self.inner.fetch_last(schema_name).await?;
        self.store_entry(entry.clone());
        Ok(entry)
    }

    async fn insert(&self, entry: &SchemaLogEntry) -> Result<()> {
        self.inner.insert(entry).await?;
        self.store_entry(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Error;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) fn test_entry(schema_name: &str, version: i64) -> SchemaLogEntry {
        SchemaLogEntry {
            id: version,
            version,
            schema_name: schema_name.to_string(),
            created_at: Utc::now(),
            schema: vec![],
        }
    }

    pub(crate) struct MockSchemaStore {
        pub fetch_last_calls: AtomicU32,
        pub entry: parking_lot::Mutex<Option<SchemaLogEntry>>,
    }

    impl MockSchemaStore {
        pub fn with_entry(entry: SchemaLogEntry) -> Self {
            Self {
                fetch_last_calls: AtomicU32::new(0),
                entry: parking_lot::Mutex::new(Some(entry)),
            }
        }

        pub fn empty() -> Self {
            Self {
                fetch_last_calls: AtomicU32::new(0),
                entry: parking_lot::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SchemaStore for MockSchemaStore {
        async fn fetch(&self, _schema_name: &str, version: i64) -> Result<SchemaLogEntry> {
            let entry = self.entry.lock();
            match entry.as_ref() {
                Some(e) if e.version == version => Ok(e.clone()),
                _ => Err(Error::SchemaLogNotFound),
            }
        }

        async fn fetch_last(&self, _schema_name: &str) -> Result<SchemaLogEntry> {
            self.fetch_last_calls.fetch_add(1, Ordering::SeqCst);
            self.entry
                .lock()
                .clone()
                .ok_or(Error::SchemaLogNotFound)
        }

        async fn insert(&self, entry: &SchemaLogEntry) -> Result<()> {
            *self.entry.lock() = Some(entry.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fetch_last_cached_within_ttl() {
        let inner = Arc::new(MockSchemaStore::with_entry(test_entry("public", 2)));
        let cache = CachedSchemaStore::new(inner.clone(), Duration::from_secs(60));

        let first = cache.fetch_last("public").await.unwrap();
        let second = cache.fetch_last("public").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.fetch_last_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_last_refreshes_after_ttl() {
        let inner = Arc::new(MockSchemaStore::with_entry(test_entry("public", 2)));
        let cache = CachedSchemaStore::new(inner.clone(), Duration::ZERO);

        cache.fetch_last("public").await.unwrap();
        *inner.entry.lock() = Some(test_entry("public", 3));
        let refreshed = cache.fetch_last("public").await.unwrap();
        assert_eq!(refreshed.version, 3);
        assert_eq!(inner.fetch_last_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_negative_results_not_cached() {
        let inner = Arc::new(MockSchemaStore::empty());
        let cache = CachedSchemaStore::new(inner.clone(), Duration::from_secs(60));

        assert!(matches!(
            cache.fetch_last("public").await,
            Err(Error::SchemaLogNotFound)
        ));

        // the entry appears, and the next fetch must see it
        inner.insert(&test_entry("public", 1)).await.unwrap();
        let entry = cache.fetch_last("public").await.unwrap();
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn test_version_never_moves_backwards() {
        let inner = Arc::new(MockSchemaStore::with_entry(test_entry("public", 5)));
        let cache = CachedSchemaStore::new(inner.clone(), Duration::from_secs(60));
        cache.fetch_last("public").await.unwrap();

        // a stale insert must not clobber the newer cached version
        cache.insert(&test_entry("public", 3)).await.unwrap();
        let entry = cache.fetch_last("public").await.unwrap();
        assert_eq!(entry.version, 5);
    }
}
