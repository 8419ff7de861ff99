//! Web layer module
//!
//! HTTP front door for the thumbnail pipeline. Handlers are thin: they turn
//! query strings into thumbnail URIs, hand them to the protocol dispatcher and
//! map the channel's stop status onto an HTTP response.

use anyhow::Result;
use axum::{Router, routing::get};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::WebConfig;
use crate::thumbnails::ThumbnailProtocol;

pub mod handlers;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub protocol: ThumbnailProtocol,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/thumbnail", get(handlers::thumbnail))
        .route("/thumbnail/cached", get(handlers::cached_thumbnail))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: &WebConfig, protocol: ThumbnailProtocol) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
        Ok(Self {
            app: router(AppState { protocol }),
            addr,
        })
    }

    /// Serve until `cancellation_token` fires
    pub async fn serve_with_cancellation(self, cancellation_token: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.addr, e))?;
        info!("Thumbnail server listening on http://{}", self.addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move {
                cancellation_token.cancelled().await;
                info!("Web server received cancellation signal, shutting down gracefully");
            })
            .await?;
        Ok(())
    }

    /// Get the host address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}
