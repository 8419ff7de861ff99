use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use page_thumbs::{
    cache::build_store,
    config::Config,
    observability::install_meter_provider,
    render::{HttpSurfaceHost, RenderPool, ThumbnailRenderer},
    thumbnails::{CollectingListener, Dispatch, ThumbnailProtocol},
    web::WebServer,
};

#[derive(Parser)]
#[command(name = "page-thumbs")]
#[command(version)]
#[command(about = "Web page thumbnail generation with a persistent cache")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Produce a single thumbnail and write it to a file
    Fetch {
        /// Thumbnail URI, e.g. page-thumb://thumbnail?url=...&width=200&height=150
        uri: String,

        /// Output PNG path
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Serve thumbnails over HTTP
    Serve {
        /// Listening IP address
        #[arg(short = 'H', long, value_name = "IP")]
        host: Option<String>,

        /// Listening port
        #[arg(short, long, value_name = "PORT")]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.log_level == "trace" {
        format!("page_thumbs={},tower_http=trace", cli.log_level)
    } else {
        format!("page_thumbs={}", cli.log_level)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting page-thumbs v{}", env!("CARGO_PKG_VERSION"));
    let meter_provider = install_meter_provider();

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    let cancellation_token = CancellationToken::new();
    let protocol = build_protocol(&config, cancellation_token.clone()).await?;

    let result = match cli.command {
        Command::Fetch { uri, output } => fetch(&protocol, &uri, &output).await,
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.web.host = host;
            }
            if let Some(port) = port {
                config.web.port = port;
            }
            serve(&config, protocol, cancellation_token.clone()).await
        }
    };

    cancellation_token.cancel();
    if let Err(e) = meter_provider.shutdown() {
        error!("Failed to shut down meter provider: {}", e);
    }
    result
}

async fn build_protocol(
    config: &Config,
    cancellation_token: CancellationToken,
) -> Result<ThumbnailProtocol> {
    let store = build_store(&config.cache, cancellation_token).await?;
    info!(
        "Thumbnail cache ready ({:?} backend)",
        config.cache.backend
    );

    let host = Arc::new(HttpSurfaceHost::new(&config.render));
    let pool = Arc::new(RenderPool::new(host, config.render.load_deadline()));
    let renderer = Arc::new(ThumbnailRenderer::from_config(pool, &config.thumbnails)?);

    Ok(ThumbnailProtocol::from_config(
        &config.thumbnails,
        store,
        renderer,
    ))
}

async fn fetch(protocol: &ThumbnailProtocol, uri: &str, output: &Path) -> Result<()> {
    let (status, body) = match protocol.new_channel(uri)? {
        Dispatch::Immediate(response) => (response.status, response.body),
        Dispatch::Channel(channel) => {
            let (listener, receiver) = CollectingListener::new();
            channel.open(listener)?;
            let collected = receiver
                .await
                .context("thumbnail channel was canceled before completing")?;
            (collected.status.http_status(), collected.body)
        }
    };

    if !(200..300).contains(&status) {
        anyhow::bail!("thumbnail request for {} finished with status {}", uri, status);
    }

    tokio::fs::write(output, &body)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!("Wrote {} byte thumbnail to {}", body.len(), output.display());
    Ok(())
}

async fn serve(
    config: &Config,
    protocol: ThumbnailProtocol,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let web_server = WebServer::new(&config.web, protocol)?;
    info!("Starting web server on {}", web_server.addr());

    let shutdown = cancellation_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    web_server.serve_with_cancellation(cancellation_token).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
