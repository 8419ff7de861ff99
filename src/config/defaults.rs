/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Thumbnail pipeline defaults
pub const DEFAULT_SCHEME: &str = "page-thumb";
pub const DEFAULT_MIN_RENDER_WIDTH: u32 = 1024;
pub const DEFAULT_BACKGROUND: &str = "#ffffff";
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024; // 16KiB

// Cache defaults
pub const DEFAULT_CACHE_PATH: &str = "./data/thumbnails";
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_CACHE_RETENTION: &str = "30d";
pub const DEFAULT_CACHE_CLEANUP_INTERVAL: &str = "12h";

// Render defaults
pub const DEFAULT_LOAD_TIMEOUT: &str = "30s";
/// Extra time the render pool waits beyond the fetch timeout
pub const LOAD_DEADLINE_MARGIN_MS: u64 = 5_000;
pub const DEFAULT_USER_AGENT: &str = concat!("page-thumbs/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 20 * 1024 * 1024; // 20MB

// Web server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
