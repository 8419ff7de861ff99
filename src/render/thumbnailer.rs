//! Page thumbnail generation
//!
//! Pages are laid out at a working width of at least `min_render_width` so
//! that small thumbnails still show the desktop layout, painted over the
//! background colour, scaled down to the requested size and encoded as PNG.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tracing::debug;

use super::{RenderJob, RenderPool, RenderedPage};
use crate::config::ThumbnailsConfig;
use crate::errors::{AppResult, RenderError, RenderResult};
use crate::observability::ThumbnailMetrics;

/// Encoded thumbnail and the status of the page it was taken from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub bytes: Vec<u8>,
    pub status: u16,
    pub width: u32,
    pub height: u32,
}

pub struct ThumbnailRenderer {
    pool: Arc<RenderPool>,
    min_render_width: u32,
    background: Rgba<u8>,
    filter: FilterType,
    metrics: ThumbnailMetrics,
}

impl ThumbnailRenderer {
    pub fn new(
        pool: Arc<RenderPool>,
        min_render_width: u32,
        background: [u8; 4],
        filter: FilterType,
    ) -> Self {
        Self {
            pool,
            min_render_width,
            background: Rgba(background),
            filter,
            metrics: ThumbnailMetrics::new(),
        }
    }

    /// Build a renderer from the `[thumbnails]` configuration section
    pub fn from_config(pool: Arc<RenderPool>, config: &ThumbnailsConfig) -> AppResult<Self> {
        Ok(Self::new(
            pool,
            config.min_render_width,
            config.background_rgba()?,
            config.resize_filter.filter_type(),
        ))
    }

    pub fn with_metrics(mut self, metrics: ThumbnailMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn pool(&self) -> &Arc<RenderPool> {
        &self.pool
    }

    /// Render `url` and produce a `width` x `height` PNG thumbnail
    pub async fn create_thumbnail(
        &self,
        url: &str,
        width: u32,
        height: u32,
    ) -> RenderResult<Thumbnail> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidSize { width, height });
        }

        let started = Instant::now();
        let job = RenderJob::sized(url, width, height, self.min_render_width);
        debug!(
            "Rendering {} at {}x{} for a {}x{} thumbnail",
            url, job.render_width, job.render_height, width, height
        );

        let RenderedPage { bitmap, status } = self.pool.render(&job).await?;

        let background = self.background;
        let filter = self.filter;
        let bytes = tokio::task::spawn_blocking(move || {
            let canvas = compose(&bitmap, &job, background);
            let scaled = imageops::resize(&canvas, job.output_width, job.output_height, filter);
            encode_png(scaled)
        })
        .await
        .map_err(|e| RenderError::EncodeTask {
            message: e.to_string(),
        })??;

        self.metrics
            .record_render(started.elapsed().as_secs_f64(), status);
        debug!(
            "Created {} byte thumbnail of {} (status {}) in {}ms",
            bytes.len(),
            url,
            status,
            started.elapsed().as_millis()
        );

        Ok(Thumbnail {
            bytes,
            status,
            width,
            height,
        })
    }
}

/// Paint `bitmap` over a background-filled canvas of the job's render size
fn compose(bitmap: &RgbaImage, job: &RenderJob, background: Rgba<u8>) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(job.render_width, job.render_height, background);
    imageops::overlay(&mut canvas, bitmap, 0, 0);
    canvas
}

fn encode_png(image: RgbaImage) -> RenderResult<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}
