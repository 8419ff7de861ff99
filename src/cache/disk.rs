//! On-disk thumbnail cache
//!
//! Every key maps to a pair of files named after the SHA-256 of the key: the
//! PNG body (`<hash>.png`) and a JSON metadata sidecar (`<hash>.json`). Keys
//! are never used as paths. Commits write to a temporary file and rename it
//! into place, so readers observe either the old or the new body. The body and
//! sidecar are renamed separately; a lookup reads the body once and drops a
//! sidecar whose recorded length disagrees with it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{CONTENT_LENGTH_METADATA, CacheStore, CachedThumbnailMetadata, ReadEntry, WriteEntry};
use crate::errors::{SinkError, StoreError, StoreResult};
use crate::thumbnails::{ByteSink, CacheKey};

const BODY_EXTENSION: &str = "png";
const METADATA_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";
/// Temporary files older than this (or the retention, if shorter) are leftovers
/// of interrupted commits
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Store persisting thumbnails as files under one directory
#[derive(Debug, Clone)]
pub struct DiskCacheStore {
    root: PathBuf,
}

/// Outcome of a disk cache sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub scanned: usize,
    pub removed: usize,
    pub bytes_freed: u64,
    pub temp_removed: usize,
    pub errors: usize,
}

impl DiskCacheStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name stem for a key: hex encoded SHA-256 of the key string
    pub fn file_stem(key: &CacheKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn body_path(&self, stem: &str) -> PathBuf {
        self.root.join(format!("{stem}.{BODY_EXTENSION}"))
    }

    fn metadata_path(&self, stem: &str) -> PathBuf {
        self.root.join(format!("{stem}.{METADATA_EXTENSION}"))
    }

    async fn read_metadata(path: &Path) -> Option<CachedThumbnailMetadata> {
        let contents = fs::read(path).await.ok()?;
        match serde_json::from_slice(&contents) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                debug!("Failed to parse metadata {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Remove entries whose last update is older than `retention`
    pub async fn cleanup_expired(&self, retention: Duration) -> StoreResult<CleanupStats> {
        info!("Starting thumbnail cache cleanup in {}", self.root.display());
        let start_time = std::time::Instant::now();

        let mut stats = CleanupStats::default();
        for body_path in self.list_bodies().await? {
            stats.scanned += 1;
            let Some(stem) = body_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let metadata_path = self.metadata_path(stem);

            let file_info = match fs::metadata(&body_path).await {
                Ok(file_info) => file_info,
                Err(e) => {
                    debug!("Failed to stat {}: {}", body_path.display(), e);
                    stats.errors += 1;
                    continue;
                }
            };

            let age = match Self::read_metadata(&metadata_path).await {
                Some(metadata) => entry_age(metadata.updated_at),
                None => file_info
                    .modified()
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .unwrap_or_default(),
            };
            if age <= retention {
                continue;
            }

            match fs::remove_file(&body_path).await {
                Ok(()) => {
                    stats.removed += 1;
                    stats.bytes_freed += file_info.len();
                    remove_if_present(&metadata_path).await;
                    debug!("Removed expired thumbnail: {}", body_path.display());
                }
                Err(e) => {
                    warn!(
                        "Failed to remove expired thumbnail {}: {}",
                        body_path.display(),
                        e
                    );
                    stats.errors += 1;
                }
            }
        }

        let temp_grace = retention.min(STALE_TEMP_AGE);
        for temp_path in self.list_files(TEMP_EXTENSION).await? {
            let age = match fs::metadata(&temp_path).await {
                Ok(file_info) => file_info
                    .modified()
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .unwrap_or_default(),
                // Renamed into place since the listing
                Err(_) => continue,
            };
            if age <= temp_grace {
                continue;
            }
            match fs::remove_file(&temp_path).await {
                Ok(()) => {
                    stats.temp_removed += 1;
                    debug!("Removed stale temporary file: {}", temp_path.display());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        "Failed to remove temporary file {}: {}",
                        temp_path.display(),
                        e
                    );
                    stats.errors += 1;
                }
            }
        }

        info!(
            "Thumbnail cache cleanup completed: removed {} of {} entries and {} temporary files ({:.1}MB freed) in {:.2}s",
            stats.removed,
            stats.scanned,
            stats.temp_removed,
            stats.bytes_freed as f64 / 1024.0 / 1024.0,
            start_time.elapsed().as_secs_f64()
        );
        Ok(stats)
    }

    /// Remove every cached thumbnail and its metadata
    pub async fn clear(&self) -> StoreResult<usize> {
        info!("Starting to clear all cached thumbnails");
        let mut removed = 0;
        for body_path in self.list_bodies().await? {
            match fs::remove_file(&body_path).await {
                Ok(()) => {
                    removed += 1;
                    if let Some(stem) = body_path.file_stem().and_then(|s| s.to_str()) {
                        remove_if_present(&self.metadata_path(stem)).await;
                    }
                }
                Err(e) => warn!("Failed to remove cached file {}: {}", body_path.display(), e),
            }
        }
        info!("Cleared {} cached thumbnails", removed);
        Ok(removed)
    }

    /// Run `cleanup_expired` every `interval` until `cancellation_token` fires
    pub async fn run_cleanup(
        &self,
        retention: Duration,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) {
        info!(
            "Starting thumbnail cache cleanup service (every {}, retention {})",
            humantime::format_duration(interval),
            humantime::format_duration(retention)
        );
        let mut cleanup_check = tokio::time::interval(interval.max(Duration::from_secs(1)));

        loop {
            tokio::select! {
                _ = cleanup_check.tick() => {
                    if let Err(e) = self.cleanup_expired(retention).await {
                        error!("Error cleaning thumbnail cache: {}", e);
                    }
                }
                _ = cancellation_token.cancelled() => {
                    info!("Thumbnail cache cleanup received cancellation signal");
                    break;
                }
            }
        }

        info!("Thumbnail cache cleanup service stopped");
    }

    async fn list_bodies(&self) -> StoreResult<Vec<PathBuf>> {
        self.list_files(BODY_EXTENSION).await
    }

    async fn list_files(&self, extension: &str) -> StoreResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) == Some(extension) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

/// Write `contents` next to `target` and rename it into place
async fn write_atomically(target: &Path, contents: &[u8]) -> std::io::Result<()> {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry");
    let temp_path = target.with_file_name(format!(
        ".{}.{}.{}",
        file_name,
        uuid::Uuid::new_v4(),
        TEMP_EXTENSION
    ));

    fs::write(&temp_path, contents).await?;
    if let Err(e) = fs::rename(&temp_path, target).await {
        remove_if_present(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn read_entry(&self, key: &CacheKey) -> StoreResult<Option<Box<dyn ReadEntry>>> {
        let stem = Self::file_stem(key);
        let body_path = self.body_path(&stem);

        let body = match fs::read(&body_path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("Disk cache miss for {}", key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut metadata = Self::read_metadata(&self.metadata_path(&stem))
            .await
            .map(|m| m.metadata)
            .unwrap_or_default();
        let recorded_length = metadata.get(CONTENT_LENGTH_METADATA).cloned();
        if recorded_length.as_deref() != Some(body.len().to_string().as_str()) {
            // Sidecar belongs to a different commit than the body we read
            debug!(
                "Sidecar for {} records {:?} bytes but body has {}, ignoring it",
                key,
                recorded_length,
                body.len()
            );
            metadata = BTreeMap::from([(
                CONTENT_LENGTH_METADATA.to_string(),
                body.len().to_string(),
            )]);
        }

        trace!("Disk cache hit for {} ({} bytes)", key, body.len());
        Ok(Some(Box::new(DiskReadEntry {
            key: key.clone(),
            body,
            metadata,
        })))
    }

    async fn write_entry(&self, key: &CacheKey) -> StoreResult<Box<dyn WriteEntry>> {
        if !fs::try_exists(&self.root).await? {
            return Err(StoreError::unavailable(
                key.as_str(),
                format!("cache directory {} is missing", self.root.display()),
            ));
        }
        let stem = Self::file_stem(key);
        Ok(Box::new(DiskWriteEntry {
            key: key.clone(),
            body_path: self.body_path(&stem),
            metadata_path: self.metadata_path(&stem),
            body: Vec::new(),
            metadata: BTreeMap::new(),
        }))
    }
}

/// Snapshot of one committed body taken at lookup time
struct DiskReadEntry {
    key: CacheKey,
    body: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

#[async_trait]
impl ReadEntry for DiskReadEntry {
    fn key(&self) -> &CacheKey {
        &self.key
    }

    fn available(&self) -> usize {
        self.body.len()
    }

    async fn read_all(&mut self) -> StoreResult<Vec<u8>> {
        Ok(self.body.clone())
    }

    fn metadata(&self, name: &str) -> Option<String> {
        self.metadata.get(name).cloned()
    }

    async fn close(self: Box<Self>) {}
}

struct DiskWriteEntry {
    key: CacheKey,
    body_path: PathBuf,
    metadata_path: PathBuf,
    body: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

impl ByteSink for DiskWriteEntry {
    fn write_all(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }
}

#[async_trait]
impl WriteEntry for DiskWriteEntry {
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
        let DiskWriteEntry {
            key,
            body_path,
            metadata_path,
            body,
            mut metadata,
        } = *self;

        metadata
            .entry(CONTENT_LENGTH_METADATA.to_string())
            .or_insert_with(|| body.len().to_string());

        let sidecar = match DiskCacheStore::read_metadata(&metadata_path).await {
            Some(previous) if previous.key == key.as_str() => previous.replaced_with(metadata),
            _ => CachedThumbnailMetadata::new(key.as_str(), metadata),
        };

        debug!(
            "Committing {} bytes to disk cache for {} at {}",
            body.len(),
            key,
            body_path.display()
        );
        write_atomically(&body_path, &body).await?;
        write_atomically(&metadata_path, &serde_json::to_vec_pretty(&sidecar)?).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) {
        trace!("Discarding uncommitted disk cache entry for {}", self.key);
    }
}

/// Age of a metadata timestamp relative to now
fn entry_age(updated_at: DateTime<Utc>) -> Duration {
    (Utc::now() - updated_at).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thumbnails::RequestDescriptor;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn key(name: &str) -> CacheKey {
        CacheKey::build(&RequestDescriptor::new(name, 64, 48).with_algorithm("v1"))
    }

    async fn commit(store: &DiskCacheStore, key: &CacheKey, body: &[u8]) {
        let mut entry = store.write_entry(key).await.unwrap();
        entry.output().write_all(body).unwrap();
        entry.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_then_read() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        commit(&store, &key("https://example.com"), b"png-bytes").await;

        let mut read = store
            .read_entry(&key("https://example.com"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.available(), 9);
        assert_eq!(read.read_all().await.unwrap(), b"png-bytes");
        assert_eq!(read.metadata(CONTENT_LENGTH_METADATA).as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn test_files_are_named_by_hash() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        let key = key("https://example.com/../../etc/passwd");
        commit(&store, &key, b"x").await;

        let stem = DiskCacheStore::file_stem(&key);
        assert_eq!(stem.len(), 64);
        assert!(dir.path().join(format!("{stem}.png")).exists());
        assert!(dir.path().join(format!("{stem}.json")).exists());

        let sidecar: CachedThumbnailMetadata = serde_json::from_slice(
            &std::fs::read(dir.path().join(format!("{stem}.json"))).unwrap(),
        )
        .unwrap();
        assert_eq!(sidecar.key, key.as_str());
    }

    #[tokio::test]
    async fn test_uncommitted_write_leaves_previous_content() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        commit(&store, &key("a"), b"old").await;

        let mut entry = store.write_entry(&key("a")).await.unwrap();
        entry.output().write_all(b"new").unwrap();
        entry.close().await;

        let mut read = store.read_entry(&key("a")).await.unwrap().unwrap();
        assert_eq!(read.read_all().await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_replacement_keeps_cached_at() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        commit(&store, &key("a"), b"one").await;
        let stem = DiskCacheStore::file_stem(&key("a"));
        let sidecar_path = dir.path().join(format!("{stem}.json"));
        let first: CachedThumbnailMetadata =
            serde_json::from_slice(&std::fs::read(&sidecar_path).unwrap()).unwrap();

        commit(&store, &key("a"), b"two").await;
        let second: CachedThumbnailMetadata =
            serde_json::from_slice(&std::fs::read(&sidecar_path).unwrap()).unwrap();

        assert_eq!(first.cached_at, second.cached_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn test_miss() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        assert!(store.read_entry(&key("absent")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        commit(&store, &key("fresh"), b"1").await;
        commit(&store, &key("stale"), b"22").await;

        let stale_stem = DiskCacheStore::file_stem(&key("stale"));
        let sidecar_path = dir.path().join(format!("{stale_stem}.json"));
        let mut sidecar: CachedThumbnailMetadata =
            serde_json::from_slice(&std::fs::read(&sidecar_path).unwrap()).unwrap();
        sidecar.updated_at = Utc::now() - chrono::Duration::days(40);
        std::fs::write(&sidecar_path, serde_json::to_vec(&sidecar).unwrap()).unwrap();

        let stats = store
            .cleanup_expired(Duration::from_secs(30 * 86400))
            .await
            .unwrap();

        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.bytes_freed, 2);
        assert!(store.read_entry(&key("stale")).await.unwrap().is_none());
        assert!(store.read_entry(&key("fresh")).await.unwrap().is_some());
        assert!(!sidecar_path.exists());
    }

    #[tokio::test]
    async fn test_cleanup_removes_stale_temporary_files() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        commit(&store, &key("kept"), b"1").await;
        let leftover = dir.path().join(".abc.png.0000.tmp");
        std::fs::write(&leftover, b"half-written").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = store
            .cleanup_expired(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(stats.temp_removed, 1);
        assert!(!leftover.exists());

        // Fresh temporary files belong to commits still in flight
        std::fs::write(&leftover, b"in-flight").unwrap();
        let stats = store
            .cleanup_expired(Duration::from_secs(30 * 86400))
            .await
            .unwrap();
        assert_eq!((stats.temp_removed, stats.removed), (0, 0));
        assert!(leftover.exists());
    }

    #[tokio::test]
    async fn test_lookup_never_mixes_sidecar_and_body_of_racing_commits() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        let key = key("https://example.com/racing");
        let small = vec![1u8; 16];
        let large = vec![2u8; 4096];
        commit(&store, &key, &small).await;

        let writers: Vec<_> = [small.clone(), large.clone()]
            .into_iter()
            .map(|body| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        commit(&store, &key, &body).await;
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let mut entry = store.read_entry(&key).await.unwrap().unwrap();
            let body = entry.read_all().await.unwrap();
            assert!(body == small || body == large);
            assert_eq!(entry.available(), body.len());
            assert_eq!(
                entry.metadata(CONTENT_LENGTH_METADATA),
                Some(body.len().to_string())
            );
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_mismatched_sidecar_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        commit(&store, &key("a"), b"short").await;
        let stem = DiskCacheStore::file_stem(&key("a"));
        std::fs::write(dir.path().join(format!("{stem}.png")), b"a much longer body").unwrap();

        let mut entry = store.read_entry(&key("a")).await.unwrap().unwrap();
        assert_eq!(entry.read_all().await.unwrap(), b"a much longer body");
        assert_eq!(
            entry.metadata(CONTENT_LENGTH_METADATA).as_deref(),
            Some("18")
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        commit(&store, &key("a"), b"1").await;
        commit(&store, &key("b"), b"2").await;

        assert_eq!(store.clear().await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(logs_contain("Cleared 2 cached thumbnails"));
    }

    #[tokio::test]
    async fn test_write_entry_fails_when_directory_vanishes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        let store = DiskCacheStore::new(&root).await.unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        assert!(store.write_entry(&key("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_run_cleanup_stops_on_cancellation() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        let token = CancellationToken::new();

        let runner = {
            let store = store.clone();
            let token = token.clone();
            tokio::spawn(async move {
                store
                    .run_cleanup(Duration::from_secs(60), Duration::from_secs(1), token)
                    .await;
            })
        };

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_entry_age() {
        let age = entry_age(Utc::now() - chrono::Duration::hours(2));
        assert!(age >= Duration::from_secs(2 * 3600 - 5));
    }
}
