//! Storage Layer
//!
//! Handles persistence of drivers, violation types and confirmed detections
//! in SQLite, and of evidence images on the local filesystem.

pub mod database;
pub mod evidence;

pub use database::{
    is_constraint_violation, Database, DetectionRecord, Driver, NewDetection, NewDriver,
    NewViolationType, ViolationType,
};
pub use evidence::{EvidenceStore, ImageStage};

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::{AppConfig, StorageSettings};

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "parkingagent", "ParkingAgent")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

    let data_dir = proj_dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "parkingagent", "ParkingAgent")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Concrete file locations derived from configuration
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub uploads_dir: PathBuf,
    pub rejected_dir: PathBuf,
    pub detector_model: PathBuf,
    pub ocr_models_dir: PathBuf,
}

impl StoragePaths {
    /// Resolve every path in the configuration, creating the data directory
    pub fn resolve(config: &AppConfig) -> Result<Self> {
        let data_dir = match &config.storage.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => get_data_dir()?,
        };

        Ok(Self::under(&data_dir, config))
    }

    /// Resolve relative paths against an explicit data directory
    pub fn under(data_dir: &Path, config: &AppConfig) -> Self {
        let StorageSettings {
            database_file,
            uploads_dir,
            rejected_dir,
            ..
        } = &config.storage;

        Self {
            data_dir: data_dir.to_path_buf(),
            database: data_dir.join(database_file),
            uploads_dir: data_dir.join(uploads_dir),
            rejected_dir: data_dir.join(rejected_dir),
            detector_model: config
                .detector
                .model_path
                .as_ref()
                .map(|p| data_dir.join(p))
                .unwrap_or_else(|| data_dir.join("weights").join("best.onnx")),
            ocr_models_dir: config
                .ocr
                .models_dir
                .as_ref()
                .map(|p| data_dir.join(p))
                .unwrap_or_else(|| data_dir.join("models")),
        }
    }
}
