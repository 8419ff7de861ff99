//! Off-screen page rendering
//!
//! Rendering is layered over three collaborators:
//!
//! - a [`SurfaceHost`] that can build the (expensive) [`HostContainer`]
//! - the container, which hands out one [`RenderSurface`] per job
//! - the surface, which loads a URL, reports load events and paints itself
//!
//! [`RenderPool`] owns the single container and [`ThumbnailRenderer`] turns a
//! painted surface into an encoded PNG thumbnail.

pub mod http_surface;
pub mod pool;
pub mod thumbnailer;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use image::RgbaImage;

pub use http_surface::HttpSurfaceHost;
pub use pool::RenderPool;
pub use thumbnailer::{Thumbnail, ThumbnailRenderer};

use crate::errors::RenderResult;

/// Identifier of a document loaded in a surface
pub type DocumentId = u64;

/// Status reported when a load event carries none
pub const DEFAULT_LOAD_STATUS: u16 = 200;
/// Status reported when the page could not be fetched or its load was cut short
pub const BAD_GATEWAY: u16 = 502;
/// Status reported when the page did not load in time
pub const GATEWAY_TIMEOUT: u16 = 504;

/// A document finished loading inside a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadEvent {
    pub document: DocumentId,
    /// HTTP-like status of the load, when the document came from a network channel
    pub status: Option<u16>,
}

/// Load events produced by one navigation
pub type LoadEvents = BoxStream<'static, LoadEvent>;

/// Factory for the shared off-screen host container
#[async_trait]
pub trait SurfaceHost: Send + Sync {
    async fn create_container(&self) -> RenderResult<Arc<dyn HostContainer>>;
}

/// Long-lived container that render surfaces are created in
#[async_trait]
pub trait HostContainer: Send + Sync {
    async fn create_surface(&self, width: u32, height: u32)
    -> RenderResult<Box<dyn RenderSurface>>;
}

/// One off-screen viewport
#[async_trait]
pub trait RenderSurface: Send {
    /// Start loading `url`; the stream yields load events for the top
    /// document and any nested documents
    async fn navigate(&mut self, url: &str) -> RenderResult<LoadEvents>;

    /// Document currently shown at the top level of the surface
    fn top_document(&self) -> DocumentId;

    /// Paint the viewport into an RGBA bitmap
    async fn paint(&mut self) -> RenderResult<RgbaImage>;

    async fn destroy(self: Box<Self>);
}

/// Work for one rendered page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    pub url: String,
    pub render_width: u32,
    pub render_height: u32,
    pub output_width: u32,
    pub output_height: u32,
}

impl RenderJob {
    /// Size a job so the page is laid out at least `min_render_width` wide,
    /// keeping the output aspect ratio
    pub fn sized(
        url: impl Into<String>,
        output_width: u32,
        output_height: u32,
        min_render_width: u32,
    ) -> Self {
        let render_width = output_width.max(min_render_width).max(1);
        let render_height = if output_width == 0 {
            1
        } else {
            let scaled = (u64::from(render_width) * u64::from(output_height)
                + u64::from(output_width) / 2)
                / u64::from(output_width);
            u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
        };

        Self {
            url: url.into(),
            render_width,
            render_height,
            output_width,
            output_height,
        }
    }
}

/// Bitmap painted for a job together with the load status of its document
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub bitmap: RgbaImage,
    pub status: u16,
}
