//! Bounded in-memory thumbnail cache

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{CONTENT_LENGTH_METADATA, CacheStore, ReadEntry, WriteEntry};
use crate::errors::{SinkError, StoreResult};
use crate::thumbnails::{ByteSink, CacheKey};

#[derive(Debug)]
struct StoredThumbnail {
    body: Bytes,
    metadata: BTreeMap<String, String>,
}

type Entries = Arc<Mutex<LruCache<CacheKey, Arc<StoredThumbnail>>>>;

/// LRU-bounded store keeping committed thumbnails in memory
#[derive(Clone)]
pub struct MemoryCacheStore {
    entries: Entries,
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Check for a committed entry without touching its recency
    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().await.contains(key)
    }

    /// Drop every committed entry, returning how many were removed
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let removed = entries.len();
        entries.clear();
        removed
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn read_entry(&self, key: &CacheKey) -> StoreResult<Option<Box<dyn ReadEntry>>> {
        let stored = self.entries.lock().await.get(key).cloned();
        match stored {
            Some(stored) => {
                trace!("Memory cache hit for {}", key);
                Ok(Some(Box::new(MemoryReadEntry {
                    key: key.clone(),
                    stored,
                })))
            }
            None => {
                trace!("Memory cache miss for {}", key);
                Ok(None)
            }
        }
    }

    async fn write_entry(&self, key: &CacheKey) -> StoreResult<Box<dyn WriteEntry>> {
        Ok(Box::new(MemoryWriteEntry {
            key: key.clone(),
            body: Vec::new(),
            metadata: BTreeMap::new(),
            entries: self.entries.clone(),
        }))
    }
}

struct MemoryReadEntry {
    key: CacheKey,
    stored: Arc<StoredThumbnail>,
}

#[async_trait]
impl ReadEntry for MemoryReadEntry {
    fn key(&self) -> &CacheKey {
        &self.key
    }

    fn available(&self) -> usize {
        self.stored.body.len()
    }

    async fn read_all(&mut self) -> StoreResult<Vec<u8>> {
        Ok(self.stored.body.to_vec())
    }

    fn metadata(&self, name: &str) -> Option<String> {
        self.stored.metadata.get(name).cloned()
    }

    async fn close(self: Box<Self>) {}
}

struct MemoryWriteEntry {
    key: CacheKey,
    body: Vec<u8>,
    metadata: BTreeMap<String, String>,
    entries: Entries,
}

impl ByteSink for MemoryWriteEntry {
    fn write_all(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }
}

#[async_trait]
impl WriteEntry for MemoryWriteEntry {
    fn key(&self) -> &CacheKey {
        &self.key
    }

    fn output(&mut self) -> &mut dyn ByteSink {
        self
    }

    fn set_metadata(&mut self, name: &str, value: &str) {
        self.metadata.insert(name.to_string(), value.to_string());
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryWriteEntry {
            key,
            body,
            mut metadata,
            entries,
        } = *self;

        metadata
            .entry(CONTENT_LENGTH_METADATA.to_string())
            .or_insert_with(|| body.len().to_string());

        debug!("Committing {} bytes to memory cache for {}", body.len(), key);
        entries.lock().await.put(
            key,
            Arc::new(StoredThumbnail {
                body: Bytes::from(body),
                metadata,
            }),
        );
        Ok(())
    }

    async fn close(self: Box<Self>) {
        trace!("Discarding uncommitted memory cache entry for {}", self.key);
    }
}
