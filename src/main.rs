//! s3proxy - transparent re-signing reverse proxy for S3-compatible object storage

use clap::Parser;
use s3proxy::config::Config;
use s3proxy::credentials::AccessProvider;
use s3proxy::http_client::HttpClient;
use s3proxy::proxy::{router, AppState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Version string including build timestamp for --version output
fn version_long() -> &'static str {
    // e.g. "0.4.2 (built 2026-02-23T21:40:07Z)"
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("S3PROXY_BUILD_TIME"),
        )
    })
}

/// s3proxy — transparent re-signing reverse proxy for S3-compatible storage
#[derive(Parser, Debug)]
#[command(name = "s3proxy")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing. Priority: RUST_LOG > LOG_LEVEL > --verbose > default
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("s3proxy=trace,tower_http=trace")
            } else {
                EnvFilter::new("s3proxy=info,tower_http=info")
            }
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration from file if specified, otherwise use default loading
    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };

    // CLI overrides
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    info!(
        "Starting s3proxy v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("S3PROXY_BUILD_TIME"),
    );
    info!("  Listen address: {}", config.listen_addr);
    info!("  Upstream endpoint: {}", config.endpoint_url);
    info!("  Signing region: {}", config.region);

    let endpoint = config.endpoint()?;
    let static_keys = config.static_credentials();
    if static_keys.is_some() {
        info!("  Credentials: static override (AWS_ACCESS_KEY_ID)");
    } else {
        info!("  Credentials: instance/task role via metadata service");
    }

    let http = Arc::new(HttpClient::new());
    let provider = AccessProvider::new(http.clone(), static_keys);
    let state = Arc::new(AppState {
        endpoint,
        provider,
        http,
    });

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("s3proxy listening on http://{}", config.listen_addr);
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.provider.close();
    info!("Server shutdown complete");
    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
