//! Parking Agent - parking violation detection backend
//!
//! Detects improperly parked vehicles in officer photos, reads their plates
//! and records confirmed violations against registered drivers.

mod analysis;
mod api;
mod config;
mod storage;
mod vision;
mod workflow;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::AppState;
use crate::config::AppConfig;
use crate::storage::{Database, EvidenceStore, StoragePaths};
use crate::vision::{
    CrnnRecognizer, DbTextDetector, ModelManager, ModelType, RegionRecognizer, YoloDetector,
};
use crate::workflow::ViolationWorkflow;

/// Parking Agent - parking violation detection backend
#[derive(Parser, Debug)]
#[command(name = "parking-agent")]
#[command(about = "HTTP backend for detecting and recording parking violations")]
struct Args {
    /// Configuration file (defaults to config.toml in the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind, overriding the configuration
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parking_agent=info,tower_http=info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    info!("Parking Agent starting...");

    let mut config = load_or_create_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("Invalid configuration")?;

    let paths = StoragePaths::resolve(&config)?;
    info!("Data directory: {:?}", paths.data_dir);

    let db = Database::open(&paths.database)?;
    db.init_schema()?;

    let evidence = EvidenceStore::new(paths.uploads_dir.clone(), paths.rejected_dir.clone())?;
    info!(
        "Evidence under {:?}, rejected images under {:?}",
        evidence.uploads_dir(),
        evidence.rejected_dir()
    );

    let detector = YoloDetector::load(&paths.detector_model, config.detector.clone())
        .with_context(|| format!("Detector model not usable at {:?}", paths.detector_model))?;

    let models = ModelManager::with_dir(paths.ocr_models_dir.clone())?;
    info!("Recognizer models in {:?}", models.models_dir());
    let detection_model = models.ensure_model(ModelType::Detection).await?;
    let recognition_model = models.ensure_model(ModelType::Recognition).await?;
    let dictionary = models.ensure_model(ModelType::Dictionary).await?;
    let recognizer = RegionRecognizer::new(
        DbTextDetector::load(&detection_model, &config.ocr)?,
        CrnnRecognizer::load(&recognition_model, &dictionary, &config.ocr)?,
    );

    let workflow = Arc::new(ViolationWorkflow::new(
        Arc::new(detector),
        Arc::new(recognizer),
        db,
        evidence,
        &config.workflow,
        &config.ocr,
    ));

    spawn_case_sweeper(workflow.clone());

    let app = api::router(Arc::new(AppState { workflow }), config.server.max_upload_bytes());

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Parking Agent shutdown complete");
    Ok(())
}

/// Load configuration from an explicit path, from the user config directory,
/// or fall back to defaults (written to the config directory for editing)
fn load_or_create_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let config = config::load_config(path)
            .with_context(|| format!("Failed to load configuration {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            match config::load_config(&config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path);
                    return Ok(config);
                }
                Err(e) => warn!("Ignoring unreadable configuration {:?}: {:#}", config_path, e),
            }
        } else {
            let config = AppConfig::default();
            match config::save_config(&config, &config_path) {
                Ok(()) => info!("Wrote default configuration to {:?}", config_path),
                Err(e) => warn!("Could not write default configuration: {:#}", e),
            }
            return Ok(config);
        }
    }

    info!("Using default configuration");
    Ok(AppConfig::default())
}

/// Periodically drop cases that outlived their TTL
fn spawn_case_sweeper(workflow: Arc<ViolationWorkflow>) {
    let period = (workflow.cases().ttl() / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let workflow = workflow.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || workflow.expire_stale_cases()).await {
                error!("Case sweeper failed: {}", e);
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
