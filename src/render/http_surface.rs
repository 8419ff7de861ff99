//! HTTP-backed render surfaces
//!
//! A lightweight host that needs no browser engine: the container is a shared
//! `reqwest` client and a surface "loads" a page by fetching it. Image
//! documents are painted fitted into the viewport; any other document paints
//! nothing, leaving the renderer's background colour. Transport failures are
//! reported as a completed load with a gateway status so they reach the
//! listener like any other non-2xx page.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::{
    BAD_GATEWAY, DocumentId, GATEWAY_TIMEOUT, HostContainer, LoadEvent, LoadEvents,
    RenderSurface, SurfaceHost,
};
use crate::config::RenderConfig;
use crate::errors::{RenderError, RenderResult};

/// Surface host fetching pages over HTTP(S)
pub struct HttpSurfaceHost {
    user_agent: String,
    request_timeout: Duration,
    max_document_size: usize,
}

impl HttpSurfaceHost {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            request_timeout: config.load_timeout,
            max_document_size: config.max_document_size,
        }
    }
}

#[async_trait]
impl SurfaceHost for HttpSurfaceHost {
    async fn create_container(&self) -> RenderResult<Arc<dyn HostContainer>> {
        let client = Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| RenderError::HostCreation {
                message: e.to_string(),
            })?;

        debug!("Created HTTP render container (user agent: {})", self.user_agent);
        Ok(Arc::new(HttpContainer {
            client,
            max_document_size: self.max_document_size,
        }))
    }
}

struct HttpContainer {
    client: Client,
    max_document_size: usize,
}

#[async_trait]
impl HostContainer for HttpContainer {
    async fn create_surface(
        &self,
        width: u32,
        height: u32,
    ) -> RenderResult<Box<dyn RenderSurface>> {
        if width == 0 || height == 0 {
            return Err(RenderError::SurfaceCreation {
                message: format!("invalid viewport {width}x{height}"),
            });
        }
        Ok(Box::new(HttpSurface {
            client: self.client.clone(),
            max_document_size: self.max_document_size,
            width,
            height,
            top_document: 0,
            current_url: String::new(),
            document: Arc::new(Mutex::new(None)),
        }))
    }
}

#[derive(Debug)]
struct LoadedDocument {
    content_type: Option<String>,
    body: Vec<u8>,
}

struct HttpSurface {
    client: Client,
    max_document_size: usize,
    width: u32,
    height: u32,
    top_document: DocumentId,
    current_url: String,
    document: Arc<Mutex<Option<LoadedDocument>>>,
}

#[async_trait]
impl RenderSurface for HttpSurface {
    async fn navigate(&mut self, url: &str) -> RenderResult<LoadEvents> {
        let parsed = url::Url::parse(url).map_err(|e| RenderError::Navigation {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RenderError::Navigation {
                url: url.to_string(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        self.top_document += 1;
        self.current_url = url.to_string();
        *self.document.lock().await = None;

        let document_id = self.top_document;
        let client = self.client.clone();
        let slot = self.document.clone();
        let max_document_size = self.max_document_size;

        let load = async move {
            let (status, document) = fetch_document(&client, parsed, max_document_size).await;
            *slot.lock().await = document;
            LoadEvent {
                document: document_id,
                status: Some(status),
            }
        };

        Ok(futures::stream::once(load).boxed())
    }

    fn top_document(&self) -> DocumentId {
        self.top_document
    }

    async fn paint(&mut self) -> RenderResult<RgbaImage> {
        let (width, height) = (self.width, self.height);
        let document = self.document.lock().await.take();

        let Some(document) = document else {
            return Ok(RgbaImage::new(width, height));
        };
        if !is_image_document(&document) {
            trace!(
                "Painting blank viewport for non-image document ({:?})",
                document.content_type
            );
            return Ok(RgbaImage::new(width, height));
        }

        tokio::task::spawn_blocking(move || paint_image_document(&document.body, width, height))
            .await
            .map_err(|e| RenderError::Paint {
                url: self.current_url.clone(),
                message: e.to_string(),
            })
    }

    async fn destroy(self: Box<Self>) {
        trace!("Destroyed HTTP surface {}x{}", self.width, self.height);
    }
}

async fn fetch_document(
    client: &Client,
    url: url::Url,
    max_document_size: usize,
) -> (u16, Option<LoadedDocument>) {
    let response = match client.get(url.clone()).send().await {
        Ok(response) => response,
        Err(e) => return (transport_failure_status(&e, &url), None),
    };

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                if body.len() + chunk.len() > max_document_size {
                    warn!(
                        "Document {} exceeds {} bytes, painting it blank",
                        url, max_document_size
                    );
                    return (status, None);
                }
                body.extend_from_slice(&chunk);
            }
            Err(e) => return (transport_failure_status(&e, &url), None),
        }
    }

    debug!("Fetched {} ({} bytes, status {})", url, body.len(), status);
    (status, Some(LoadedDocument { content_type, body }))
}

fn transport_failure_status(error: &reqwest::Error, url: &url::Url) -> u16 {
    if error.is_timeout() {
        warn!("Timed out fetching {}: {}", url, error);
        GATEWAY_TIMEOUT
    } else {
        warn!("Failed to fetch {}: {}", url, error);
        BAD_GATEWAY
    }
}

fn is_image_document(document: &LoadedDocument) -> bool {
    match &document.content_type {
        Some(content_type) if content_type.starts_with("image/") => true,
        _ => image::guess_format(&document.body).is_ok(),
    }
}

/// Decode an image document and fit it, centred, into the viewport
fn paint_image_document(body: &[u8], width: u32, height: u32) -> RgbaImage {
    let mut canvas = RgbaImage::new(width, height);
    match image::load_from_memory(body) {
        Ok(decoded) => {
            let fitted = decoded.resize(width, height, FilterType::Triangle).to_rgba8();
            let x = i64::from((width - fitted.width().min(width)) / 2);
            let y = i64::from((height - fitted.height().min(height)) / 2);
            imageops::overlay(&mut canvas, &fitted, x, y);
        }
        Err(e) => debug!("Failed to decode image document: {}", e),
    }
    canvas
}
