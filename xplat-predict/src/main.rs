//! xplat-predict - Prediction pipeline service
//!
//! Accepts CSV uploads, runs each row through the external inference service
//! on a pool of queue workers, and serves results and signed plot images over
//! HTTP. API server and workers run in one process and share one SQLite file.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use xplat_common::config::{load_toml_layer, ConfigOverrides, ServiceConfig};
use xplat_predict::services::{InferenceApi, InferenceClient};
use xplat_predict::{build_router, AppState};

/// Command-line arguments for xplat-predict
#[derive(Parser, Debug)]
#[command(name = "xplat-predict")]
#[command(about = "Explainable prediction pipeline service")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "XPLAT_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long, env = "XPLAT_BIND_ADDRESS")]
    bind: Option<String>,

    /// Folder holding the database and artifacts
    #[arg(long, env = "XPLAT_DATA_FOLDER")]
    data_folder: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, env = "XPLAT_DATABASE_PATH")]
    database: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "XPLAT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Inference service base URL
    #[arg(long, env = "INFERENCE_SERVICE_URL")]
    inference_url: Option<String>,

    /// Host header sent to the inference ingress
    #[arg(long, env = "INFERENCE_HOST_HEADER")]
    inference_host: Option<String>,

    /// Folder for stored plot images
    #[arg(long, env = "XPLAT_ARTIFACT_FOLDER")]
    artifact_folder: Option<PathBuf>,

    /// Externally visible base URL used in signed artifact links
    #[arg(long, env = "XPLAT_PUBLIC_BASE_URL")]
    public_url: Option<String>,

    /// Secret for signing artifact URLs
    #[arg(long, env = "XPLAT_SIGNING_SECRET", hide_env_values = true)]
    signing_secret: Option<String>,

    /// Number of queue workers
    #[arg(short, long, env = "XPLAT_WORKERS")]
    workers: Option<usize>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind_address: self.bind.clone(),
            data_folder: self.data_folder.clone(),
            database_path: self.database.clone(),
            log_level: self.log_level.clone(),
            inference_url: self.inference_url.clone(),
            inference_host_header: self.inference_host.clone(),
            artifact_folder: self.artifact_folder.clone(),
            public_base_url: self.public_url.clone(),
            signing_secret: self.signing_secret.clone(),
            worker_count: self.workers,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The TOML layer is read before tracing starts because it may set the log level
    let toml_config = load_toml_layer(args.config.as_deref())
        .context("Failed to load configuration file")?;
    let default_level = args
        .log_level
        .clone()
        .or_else(|| toml_config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&default_level)),
        )
        .init();

    // Log build identification immediately after tracing init
    info!(
        "Starting xplat-predict v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let config = ServiceConfig::resolve(&args.overrides(), &toml_config)
        .context("Invalid configuration")?;
    info!("Database: {}", config.database_path.display());
    info!("Artifacts: {}", config.storage.artifact_folder.display());
    info!("Inference service: {}", config.inference.base_url);

    let db = xplat_common::db::init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    info!("✓ Database ready");

    std::fs::create_dir_all(&config.storage.artifact_folder).with_context(|| {
        format!(
            "Failed to create artifact folder {}",
            config.storage.artifact_folder.display()
        )
    })?;

    let inference: Arc<dyn InferenceApi> = Arc::new(
        InferenceClient::new(&config.inference).context("Failed to build inference client")?,
    );

    let state = AppState::from_config(db.clone(), &config, inference)
        .context("Failed to configure artifact store")?;
    state
        .queue
        .recover_stale()
        .await
        .context("Failed to recover interrupted jobs")?;

    let shutdown = CancellationToken::new();
    let workers = state
        .worker_pool(config.queue.worker_count)
        .spawn(shutdown.clone());

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_address))?;
    info!("xplat-predict listening on http://{}", config.bind_address);
    info!("Health check: http://{}/health", config.bind_address);

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await;

    // Workers finish their current job before exiting
    shutdown.cancel();
    workers.join().await;
    db.close().await;

    if let Err(e) = server_result {
        error!("Server error: {}", e);
        return Err(e).context("Server error");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM and cancels `shutdown`
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
}
