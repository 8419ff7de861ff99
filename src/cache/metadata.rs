//! Metadata structures for cached thumbnails

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata stored in .json files next to cached thumbnails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedThumbnailMetadata {
    /// Cache key this thumbnail was stored under
    pub key: String,
    /// Entry metadata set by the writer (e.g. content-length)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// When a thumbnail was first cached under this key
    pub cached_at: DateTime<Utc>,
    /// Last time the thumbnail for this key was replaced
    pub updated_at: DateTime<Utc>,
}

impl CachedThumbnailMetadata {
    pub fn new(key: impl Into<String>, metadata: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            metadata,
            cached_at: now,
            updated_at: now,
        }
    }

    /// Metadata for a replacement of `self`, keeping the original cache time
    pub fn replaced_with(&self, metadata: BTreeMap<String, String>) -> Self {
        Self {
            key: self.key.clone(),
            metadata,
            cached_at: self.cached_at,
            updated_at: Utc::now(),
        }
    }
}
