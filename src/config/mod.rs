//! Application Configuration
//!
//! Service settings stored in TOML format.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::analysis::UnknownClassPolicy;
use crate::vision::crop::DEFAULT_CROP_MARGIN;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP server settings
    pub server: ServerSettings,
    /// Database and evidence locations
    pub storage: StorageSettings,
    /// Object detector settings
    pub detector: DetectorSettings,
    /// Plate text recognition settings
    pub ocr: OcrSettings,
    /// Violation workflow settings
    pub workflow: WorkflowSettings,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum accepted request body in megabytes (image uploads)
    pub max_upload_mb: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_upload_mb: 20,
        }
    }
}

impl ServerSettings {
    /// Socket address string for the listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Upload limit in bytes
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}

/// Storage locations. Relative paths resolve against `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base directory; the platform data directory when unset
    pub data_dir: Option<PathBuf>,
    /// SQLite database file
    pub database_file: PathBuf,
    /// Uploaded evidence images
    pub uploads_dir: PathBuf,
    /// Archive of rejected images kept for retraining
    pub rejected_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_file: PathBuf::from("parking.db"),
            uploads_dir: PathBuf::from("uploads"),
            rejected_dir: PathBuf::from("rejected"),
        }
    }
}

/// Object detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// ONNX export of the detector; `<data_dir>/weights/best.onnx` when unset
    pub model_path: Option<PathBuf>,
    /// Class labels in model output order
    pub class_names: Vec<String>,
    /// Square model input size in pixels
    pub input_size: u32,
    /// Minimum class score for a detection (0.0 - 1.0)
    pub confidence_threshold: f32,
    /// IoU above which overlapping boxes of the same class are suppressed
    pub iou_threshold: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            class_names: vec![
                "tablica".to_string(),
                "NepropisnoParkirano".to_string(),
                "PropisnoParkirano".to_string(),
            ],
            input_size: 640,
            confidence_threshold: 0.25,
            iou_threshold: 0.7,
        }
    }
}

/// Plate text recognition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Directory holding recognizer models; `<data_dir>/models` when unset
    pub models_dir: Option<PathBuf>,
    /// Upscale factor applied to plate crops before recognition
    pub upscale: f32,
    /// Maximum recognizer input width in pixels
    pub max_input_width: u32,
    /// Readings below this confidence are dropped (0.0 - 1.0)
    pub min_confidence: f32,
    /// Longest side of the text detector input in pixels
    pub det_limit_side: u32,
    /// Text probability above which a pixel belongs to a region
    pub det_threshold: f32,
    /// Minimum mean text probability of a region
    pub det_box_threshold: f32,
    /// How far detected regions are grown before recognition
    pub det_unclip_ratio: f32,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            models_dir: None,
            upscale: 2.3,
            max_input_width: 320,
            min_confidence: 0.0,
            det_limit_side: 960,
            det_threshold: 0.3,
            det_box_threshold: 0.6,
            det_unclip_ratio: 1.5,
        }
    }
}

/// Violation workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Prefix shared by all violation class labels
    pub violation_class_prefix: String,
    /// Class label of license plates
    pub plate_class: String,
    /// Margin in pixels added around plate boxes before OCR
    pub crop_margin: u32,
    /// Seconds a case waits for its zoom image or decision
    pub session_ttl_secs: u64,
    /// Handling of violation classes missing from the database
    pub unknown_class_policy: UnknownClassPolicy,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            violation_class_prefix: "NepropisnoParkirano".to_string(),
            plate_class: "tablica".to_string(),
            crop_margin: DEFAULT_CROP_MARGIN,
            session_ttl_secs: 600,
            unknown_class_policy: UnknownClassPolicy::TreatAsCompliant,
        }
    }
}

impl AppConfig {
    /// Reject values the models cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.detector.input_size > 0, "detector.input_size must be positive");
        ensure!(
            !self.detector.class_names.is_empty(),
            "detector.class_names must not be empty"
        );
        ensure!(self.ocr.max_input_width > 0, "ocr.max_input_width must be positive");
        ensure!(self.ocr.det_limit_side > 0, "ocr.det_limit_side must be positive");
        ensure!(self.server.max_upload_mb > 0, "server.max_upload_mb must be positive");
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
