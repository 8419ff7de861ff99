use anyhow::Result;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use defaults::*;
use duration_serde::duration;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub thumbnails: ThumbnailsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub web: WebConfig,
}

/// Thumbnail pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailsConfig {
    /// URI scheme handled by the protocol dispatcher
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Minimum width pages are rasterized at before scaling down
    #[serde(default = "default_min_render_width")]
    pub min_render_width: u32,
    /// Background colour pages are composited over, as `#rrggbb` or `#rrggbbaa`
    #[serde(default = "default_background")]
    pub background: String,
    /// Filter used when scaling the rasterized page down
    #[serde(default)]
    pub resize_filter: ResizeFilter,
    /// Size of the chunks cached bytes are streamed to listeners in
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Scaling filters understood by the renderer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFilter {
    Nearest,
    #[default]
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

/// Cache store selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    /// Directory used by the disk backend
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    /// Entry bound of the memory backend
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Age after which disk entries are swept
    #[serde(default = "default_cache_retention", with = "duration")]
    pub retention: Duration,
    #[serde(default = "default_cache_cleanup_interval", with = "duration")]
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// How long a surface may take to load its top document
    #[serde(default = "default_load_timeout", with = "duration")]
    pub load_timeout: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Largest document body the HTTP surface host will download
    #[serde(default = "default_max_document_size")]
    pub max_document_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}
fn default_min_render_width() -> u32 {
    DEFAULT_MIN_RENDER_WIDTH
}
fn default_background() -> String {
    DEFAULT_BACKGROUND.to_string()
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_cache_path() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_PATH)
}
fn default_cache_max_entries() -> usize {
    DEFAULT_CACHE_MAX_ENTRIES
}
fn default_cache_retention() -> Duration {
    parse_default_duration(DEFAULT_CACHE_RETENTION)
}
fn default_cache_cleanup_interval() -> Duration {
    parse_default_duration(DEFAULT_CACHE_CLEANUP_INTERVAL)
}
fn default_load_timeout() -> Duration {
    parse_default_duration(DEFAULT_LOAD_TIMEOUT)
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_max_document_size() -> usize {
    DEFAULT_MAX_DOCUMENT_SIZE
}
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}

fn parse_default_duration(value: &str) -> Duration {
    humantime::parse_duration(value).unwrap_or_default()
}

impl Default for ThumbnailsConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            min_render_width: default_min_render_width(),
            background: default_background(),
            resize_filter: ResizeFilter::default(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            path: default_cache_path(),
            max_entries: default_cache_max_entries(),
            retention: default_cache_retention(),
            cleanup_interval: default_cache_cleanup_interval(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            load_timeout: default_load_timeout(),
            user_agent: default_user_agent(),
            max_document_size: default_max_document_size(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ThumbnailsConfig {
    /// Parse the configured background colour into RGBA components
    pub fn background_rgba(&self) -> AppResult<[u8; 4]> {
        parse_hex_color(&self.background)
    }
}

impl RenderConfig {
    /// Deadline for a whole page load in the render pool.
    ///
    /// Longer than `load_timeout` so the fetch timeout fires first and the
    /// page is reported with the host's own status.
    pub fn load_deadline(&self) -> Duration {
        self.load_timeout + Duration::from_millis(LOAD_DEADLINE_MARGIN_MS)
    }
}

impl ResizeFilter {
    pub fn filter_type(self) -> FilterType {
        match self {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Gaussian => FilterType::Gaussian,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Parse `#rgb`, `#rrggbb` or `#rrggbbaa` into RGBA components
pub fn parse_hex_color(value: &str) -> AppResult<[u8; 4]> {
    let hex_digits = value.trim().trim_start_matches('#');
    let expanded: String = match hex_digits.len() {
        3 => hex_digits.chars().flat_map(|c| [c, c]).collect(),
        6 | 8 => hex_digits.to_string(),
        _ => {
            return Err(AppError::configuration(format!(
                "Invalid colour '{value}': expected #rgb, #rrggbb or #rrggbbaa"
            )));
        }
    };

    let bytes = hex::decode(&expanded)
        .map_err(|e| AppError::configuration(format!("Invalid colour '{value}': {e}")))?;

    Ok([bytes[0], bytes[1], bytes[2], bytes.get(3).copied().unwrap_or(255)])
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from_file(&config_file)
    }

    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            let config: Self = toml::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
            Ok(default_config)
        }
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> AppResult<()> {
        if self.thumbnails.scheme.is_empty()
            || !self
                .thumbnails
                .scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(AppError::configuration(format!(
                "Invalid thumbnail scheme '{}'",
                self.thumbnails.scheme
            )));
        }
        if self.thumbnails.min_render_width == 0 {
            return Err(AppError::configuration("min_render_width must be positive"));
        }
        if self.thumbnails.chunk_size == 0 {
            return Err(AppError::configuration("chunk_size must be positive"));
        }
        if self.cache.max_entries == 0 {
            return Err(AppError::configuration("cache.max_entries must be positive"));
        }
        self.thumbnails.background_rgba()?;
        Ok(())
    }
}
