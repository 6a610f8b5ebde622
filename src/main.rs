// ABOUTME: Entry point for the ingestd binary.
// ABOUTME: Parses CLI arguments, opens storage, starts the pipeline, and serves the HTTP API until signalled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ingestd_core::Pipeline;
use ingestd_server::{AppState, IngestdConfig, MetricsRecorder, Overrides, create_router};
use ingestd_store::StorageManager;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ingestd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Event ingestion daemon with bounded buffering and backpressure", long_about = None)]
struct Cli {
    /// Data directory (overrides INGESTD_HOME)
    #[arg(long)]
    home: Option<PathBuf>,

    /// Socket address to listen on (overrides INGESTD_BIND)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// YAML pipeline config file (overrides INGESTD_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ingestd=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = IngestdConfig::from_env(Overrides {
        home: cli.home,
        bind: cli.bind,
        config_file: cli.config,
    })
    .context("failed to load configuration")?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config.pipeline)?);
        return Ok(());
    }

    info!(
        home = %config.home.display(),
        bind = %config.bind,
        capacity = config.pipeline.buffer.capacity,
        chunk_size = config.pipeline.worker.batch_chunk_size,
        "ingestd starting up"
    );

    let manager = StorageManager::new(config.home.clone()).context("failed to prepare data directory")?;
    let stores = manager.open().context("failed to open storage")?;

    let pipeline = Arc::new(
        Pipeline::start(config.pipeline.clone(), stores.collaborators())
            .await
            .context("failed to start pipeline")?,
    );

    let recorder = MetricsRecorder::spawn(
        pipeline.clone(),
        stores.history.clone(),
        config.pipeline.metrics.history_interval(),
    );

    let state = Arc::new(
        AppState::new(pipeline.clone())
            .with_dead_letters(stores.dead_letters.clone())
            .with_history(stores.history.clone()),
    );
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("draining pipeline");
    match pipeline.shutdown().await {
        Some(report) => info!(
            drained = report.drained_on_shutdown,
            remaining = report.remaining,
            timed_out = report.timed_out,
            checkpoint = report.checkpoint.last_flushed_sequence,
            "pipeline stopped"
        ),
        None => warn!("pipeline was already stopped"),
    }
    recorder.stop().await;

    info!("ingestd shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
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
    info!("shutdown signal received");
}
