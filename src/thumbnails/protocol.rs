//! Front door for thumbnail URIs
//!
//! `page-thumb://thumbnail?url=<enc>&width=<n>&height=<n>[&algorithm=<s>][&refresh=1]`
//!
//! The dispatcher validates the scheme, answers the blank page with a static
//! placeholder, unwraps thumbnails of thumbnails and otherwise builds a
//! [`Channel`] bound to the shared cache store and renderer.

use std::io::Cursor;
use std::sync::{Arc, OnceLock};

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tracing::{debug, trace, warn};

use super::channel::{Channel, ChannelMode};
use super::descriptor::{RequestDescriptor, parse_params};
use super::listener::{ChannelStatus, ThumbnailListener};
use super::{BLANK_PAGE, CONTENT_TYPE};
use crate::cache::CacheStore;
use crate::config::{ThumbnailsConfig, defaults::DEFAULT_CHUNK_SIZE};
use crate::errors::{ListenerError, ProtocolError};
use crate::observability::{RequestOutcome, ThumbnailMetrics};
use crate::render::ThumbnailRenderer;

/// Host component of URIs built by [`ThumbnailProtocol::thumbnail_uri`]
const URI_HOST: &str = "thumbnail";

/// What the dispatcher produced for a URI
pub enum Dispatch {
    /// A response available without touching the cache or the renderer
    Immediate(StaticResponse),
    /// A channel the caller must open with a listener
    Channel(Channel),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Immediate(response) => f.debug_tuple("Immediate").field(response).finish(),
            Dispatch::Channel(channel) => f.debug_tuple("Channel").field(channel).finish(),
        }
    }
}

/// Fixed response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl StaticResponse {
    /// 1x1 white PNG answered for the blank page
    pub fn placeholder() -> Self {
        Self {
            status: 200,
            content_type: CONTENT_TYPE,
            body: placeholder_png().to_vec(),
        }
    }

    /// Play the response through a listener's callbacks
    pub fn deliver<L: ThumbnailListener + ?Sized>(
        &self,
        listener: &mut L,
    ) -> Result<(), ListenerError> {
        listener.on_start()?;
        listener.on_data(&self.body)?;
        listener.on_stop(ChannelStatus::Completed(self.status))
    }
}

fn placeholder_png() -> &'static [u8] {
    static PLACEHOLDER: OnceLock<Vec<u8>> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        let pixel = RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 255]));
        let mut bytes = Vec::new();
        let encoded =
            DynamicImage::ImageRgba8(pixel).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png);
        if let Err(e) = encoded {
            warn!("Failed to encode placeholder thumbnail: {}", e);
        }
        bytes
    })
}

/// Dispatcher turning thumbnail URIs into channels
#[derive(Clone)]
pub struct ThumbnailProtocol {
    scheme: String,
    store: Arc<dyn CacheStore>,
    renderer: Arc<ThumbnailRenderer>,
    chunk_size: usize,
    metrics: ThumbnailMetrics,
}

impl ThumbnailProtocol {
    pub fn new(
        scheme: impl Into<String>,
        store: Arc<dyn CacheStore>,
        renderer: Arc<ThumbnailRenderer>,
    ) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            store,
            renderer,
            chunk_size: DEFAULT_CHUNK_SIZE,
            metrics: ThumbnailMetrics::new(),
        }
    }

    pub fn from_config(
        config: &ThumbnailsConfig,
        store: Arc<dyn CacheStore>,
        renderer: Arc<ThumbnailRenderer>,
    ) -> Self {
        Self::new(config.scheme.clone(), store, renderer).with_chunk_size(config.chunk_size)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: ThumbnailMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Build a thumbnail URI for `url` handled by this dispatcher
    pub fn thumbnail_uri(
        &self,
        url: &str,
        width: u32,
        height: u32,
        algorithm: Option<&str>,
    ) -> String {
        let mut uri = format!(
            "{}://{}?url={}&width={}&height={}",
            self.scheme,
            URI_HOST,
            urlencoding::encode(url),
            width,
            height
        );
        if let Some(algorithm) = algorithm.filter(|a| !a.is_empty()) {
            uri.push_str("&algorithm=");
            uri.push_str(&urlencoding::encode(algorithm));
        }
        uri
    }

    /// Whether `uri` uses this dispatcher's scheme
    pub fn handles(&self, uri: &str) -> bool {
        uri.split_once(':')
            .is_some_and(|(scheme, _)| scheme.eq_ignore_ascii_case(&self.scheme))
    }

    /// Dispatch a request that may render on a cache miss
    pub fn new_channel(&self, uri: &str) -> Result<Dispatch, ProtocolError> {
        self.dispatch(uri, ChannelMode::Generate)
    }

    /// Dispatch a request that only ever serves cached thumbnails
    pub fn new_cached_channel(&self, uri: &str) -> Result<Dispatch, ProtocolError> {
        self.dispatch(uri, ChannelMode::CacheOnly)
    }

    fn dispatch(&self, uri: &str, mode: ChannelMode) -> Result<Dispatch, ProtocolError> {
        if !self.handles(uri) {
            return Err(ProtocolError::UnsupportedScheme {
                uri: uri.to_string(),
                expected: self.scheme.clone(),
            });
        }

        let mut descriptor = RequestDescriptor::from_uri(uri)?;
        while self.handles(descriptor.target_url()) {
            let inner_target = descriptor
                .target_url()
                .split_once('?')
                .and_then(|(_, query)| parse_params(query).remove("url"))
                .unwrap_or_default();
            trace!(
                "Unwrapping nested thumbnail request {} -> {}",
                descriptor.target_url(),
                inner_target
            );
            descriptor = descriptor.with_target_url(inner_target);
        }

        if descriptor.target_url() == BLANK_PAGE {
            debug!("Serving placeholder for {}", uri);
            self.metrics.record_request(RequestOutcome::Placeholder);
            return Ok(Dispatch::Immediate(StaticResponse::placeholder()));
        }
        if descriptor.target_url().is_empty() {
            return Err(ProtocolError::MissingTarget {
                uri: uri.to_string(),
            });
        }

        Ok(Dispatch::Channel(Channel::new(
            uri.to_string(),
            descriptor,
            mode,
            self.store.clone(),
            self.renderer.clone(),
            self.chunk_size,
            self.metrics.clone(),
        )))
    }
}
