//! webdav_ingest - WebDAV server with staged, chunked and quota-checked uploads

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{any, get},
    Router,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webdav_ingest::api::handlers::{dispatch, health_check, AppState};
use webdav_ingest::config::Config;
use webdav_ingest::dav::DavService;
use webdav_ingest::metrics::{http_metrics_middleware, metrics_handler, Metrics};

/// webdav_ingest - WebDAV file ingest server
#[derive(Parser, Debug)]
#[command(name = "webdav_ingest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Data directory (overrides config)
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from file if specified, otherwise use default loading
    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()
    };

    // CLI overrides
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }
    if let Some(ref dir) = cli.data_dir {
        config.data_dir = dir.clone();
    }

    let log_level = if cli.verbose {
        "webdav_ingest=trace,tower_http=trace".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting webdav_ingest");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Data directory: {:?}", config.data_dir);
    info!(
        "  Max upload size: {} MB",
        config.max_upload_size / 1024 / 1024
    );
    match config.quota_bytes {
        Some(q) => info!("  Per-user quota: {} bytes", q),
        None => info!("  Per-user quota: free disk space"),
    }
    info!("  Chunk TTL: {}s", config.chunk_ttl_secs);
    if !config.staging_writes {
        warn!("  Staging writes are DISABLED; partial uploads are visible under their final name");
    }

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let service = DavService::new(config.service_options());
    if let Err(e) = service.startup_sweep().await {
        warn!("Startup sweep failed: {}", e);
    }

    let metrics = Metrics::new();
    metrics
        .process_start_time_seconds
        .set(chrono::Utc::now().timestamp() as f64);
    metrics
        .build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    let state = Arc::new(AppState::new(service, Some(metrics)));

    // Routes:
    //   GET /health                              - health check
    //   GET /metrics                             - Prometheus metrics
    //   *   /remote.php/dav/files/{user}[/path]  - WebDAV (PUT, GET, HEAD,
    //                                              DELETE, MKCOL, MOVE, COPY)
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/remote.php/dav/files/:user", any(dispatch))
        .route("/remote.php/dav/files/:user/", any(dispatch))
        .route("/remote.php/dav/files/:user/*path", any(dispatch))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            http_metrics_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        // uploads are streamed; the pipeline enforces max_upload_size itself
        .layer(DefaultBodyLimit::disable())
        .with_state(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("webdav_ingest listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

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
