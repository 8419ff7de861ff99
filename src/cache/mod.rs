//! Thumbnail cache stores
//!
//! A store hands out two kinds of entry for a [`CacheKey`]:
//!
//! - a **read entry**, present only when bytes were committed for the key
//! - a **write entry**, always allocatable unless the store itself fails
//!
//! Bytes written to a write entry are invisible to readers until the entry is
//! committed. Closing a write entry without committing discards what was
//! written and leaves any previous content for the key untouched.

pub mod disk;
pub mod memory;
pub mod metadata;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use disk::{CleanupStats, DiskCacheStore};
pub use memory::MemoryCacheStore;
pub use metadata::CachedThumbnailMetadata;

use crate::config::{CacheBackend, CacheConfig};
use crate::errors::StoreResult;
use crate::thumbnails::{ByteSink, CacheKey};

/// Metadata name carrying the committed body length
pub const CONTENT_LENGTH_METADATA: &str = "content-length";

/// Asynchronous key/value store for encoded thumbnails
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up committed bytes for `key`
    async fn read_entry(&self, key: &CacheKey) -> StoreResult<Option<Box<dyn ReadEntry>>>;

    /// Allocate an uncommitted entry for `key`
    async fn write_entry(&self, key: &CacheKey) -> StoreResult<Box<dyn WriteEntry>>;
}

/// Handle to committed bytes for one key
#[async_trait]
pub trait ReadEntry: Send {
    fn key(&self) -> &CacheKey;

    /// Number of bytes that can be read
    fn available(&self) -> usize;

    async fn read_all(&mut self) -> StoreResult<Vec<u8>>;

    fn metadata(&self, name: &str) -> Option<String>;

    /// Release the entry
    async fn close(self: Box<Self>);
}

/// Handle to an uncommitted entry for one key
#[async_trait]
pub trait WriteEntry: Send {
    fn key(&self) -> &CacheKey;

    /// Sink receiving the entry body
    fn output(&mut self) -> &mut dyn ByteSink;

    fn set_metadata(&mut self, name: &str, value: &str);

    /// Publish the written bytes, replacing any previous content for the key
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discard the written bytes
    async fn close(self: Box<Self>);
}

/// Build the store selected by the cache configuration.
///
/// For the disk backend this also starts the periodic expiry sweep, which
/// runs until `cancellation_token` fires.
pub async fn build_store(
    config: &CacheConfig,
    cancellation_token: CancellationToken,
) -> StoreResult<Arc<dyn CacheStore>> {
    match config.backend {
        CacheBackend::Memory => {
            info!(
                "Using in-memory thumbnail cache (max {} entries)",
                config.max_entries
            );
            Ok(Arc::new(MemoryCacheStore::new(config.max_entries)))
        }
        CacheBackend::Disk => {
            let store = DiskCacheStore::new(&config.path).await?;
            info!("Using disk thumbnail cache at {}", config.path.display());

            let cleanup_store = store.clone();
            let retention = config.retention;
            let interval = config.cleanup_interval;
            tokio::spawn(async move {
                cleanup_store
                    .run_cleanup(retention, interval, cancellation_token)
                    .await;
            });

            Ok(Arc::new(store))
        }
    }
}
