//! Deterministic cache keys for thumbnail requests

use std::fmt;

use serde::{Deserialize, Serialize};

use super::descriptor::RequestDescriptor;

/// Canonical string key identifying one cached thumbnail.
///
/// Built from the algorithm, target URL and output size in that fixed order.
/// The force-refresh flag never contributes, so a refresh overwrites the entry
/// a plain request would read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn build(descriptor: &RequestDescriptor) -> Self {
        let width = descriptor.width().to_string();
        let height = descriptor.height().to_string();
        let fields: [(&str, &str); 4] = [
            ("algorithm", descriptor.algorithm()),
            ("url", descriptor.target_url()),
            ("width", width.as_str()),
            ("height", height.as_str()),
        ];

        let key = fields
            .iter()
            .map(|(name, value)| {
                format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
            })
            .collect::<Vec<_>>()
            .join("&");

        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&RequestDescriptor> for CacheKey {
    fn from(descriptor: &RequestDescriptor) -> Self {
        Self::build(descriptor)
    }
}
