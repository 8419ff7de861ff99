use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter, MeterProvider},
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tracing::info;

/// How a thumbnail request ended, as recorded in metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    CacheHit,
    Rendered,
    Placeholder,
    Failed,
    Canceled,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::CacheHit => "cache_hit",
            RequestOutcome::Rendered => "rendered",
            RequestOutcome::Placeholder => "placeholder",
            RequestOutcome::Failed => "failed",
            RequestOutcome::Canceled => "canceled",
        }
    }
}

/// Install a local meter provider as the global provider
///
/// Instruments created before this call keep reporting to the no-op provider.
pub fn install_meter_provider() -> SdkMeterProvider {
    let provider = SdkMeterProvider::builder().build();
    global::set_meter_provider(provider.clone());
    info!("OpenTelemetry configured: local metrics only");
    provider
}

/// Pre-built instruments for the thumbnail pipeline
#[derive(Clone)]
pub struct ThumbnailMetrics {
    pub meter: Meter,
    pub requests: Counter<u64>,
    pub cache_commits: Counter<u64>,
    pub cache_write_failures: Counter<u64>,
    pub host_creations: Counter<u64>,
    pub render_duration: Histogram<f64>,
    pub thumbnail_bytes: Histogram<u64>,
}

impl ThumbnailMetrics {
    /// Build instruments on the global meter
    pub fn new() -> Self {
        Self::build_with_instruments(global::meter("page-thumbs"))
    }

    /// Build instruments on a meter from the given provider
    pub fn from_provider(provider: &SdkMeterProvider) -> Self {
        Self::build_with_instruments(provider.meter("page-thumbs"))
    }

    fn build_with_instruments(meter: Meter) -> Self {
        let requests = meter
            .u64_counter("thumbnail_requests_total")
            .with_description("Thumbnail requests by outcome")
            .build();
        let cache_commits = meter
            .u64_counter("thumbnail_cache_commits_total")
            .with_description("Thumbnails committed to the cache")
            .build();
        let cache_write_failures = meter
            .u64_counter("thumbnail_cache_write_failures_total")
            .with_description("Cache writes that were dropped uncommitted")
            .build();
        let host_creations = meter
            .u64_counter("render_host_creations_total")
            .with_description("Off-screen render host creations")
            .build();
        let render_duration = meter
            .f64_histogram("thumbnail_render_duration_seconds")
            .with_description("Time to load, paint and encode a thumbnail")
            .build();
        let thumbnail_bytes = meter
            .u64_histogram("thumbnail_size_bytes")
            .with_description("Encoded thumbnail size")
            .build();

        Self {
            meter,
            requests,
            cache_commits,
            cache_write_failures,
            host_creations,
            render_duration,
            thumbnail_bytes,
        }
    }

    pub fn record_request(&self, outcome: RequestOutcome) {
        self.requests
            .add(1, &[KeyValue::new("outcome", outcome.as_str())]);
    }

    pub fn record_cache_commit(&self, bytes: usize) {
        self.cache_commits.add(1, &[]);
        self.thumbnail_bytes.record(bytes as u64, &[]);
    }

    pub fn record_cache_write_failure(&self) {
        self.cache_write_failures.add(1, &[]);
    }

    pub fn record_host_creation(&self, success: bool) {
        self.host_creations
            .add(1, &[KeyValue::new("success", success)]);
    }

    pub fn record_render(&self, seconds: f64, status: u16) {
        self.render_duration
            .record(seconds, &[KeyValue::new("status", i64::from(status))]);
    }
}

impl Default for ThumbnailMetrics {
    fn default() -> Self {
        Self::new()
    }
}
