//! Evidence image storage
//!
//! Uploads live in one directory per case (`uploads/<case id>/`) and every
//! stored file gets its own name, so concurrent requests never write to the
//! same path. Rejected images are
//! copied to `rejected/first` and `rejected/zoom` for later retraining.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Extension used when an upload's format cannot be guessed
const FALLBACK_EXTENSION: &str = "jpg";

/// Which photo of the two-step workflow an upload is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStage {
    /// Wide shot of the parked vehicle
    First,
    /// Close-up showing the plate
    Zoom,
}

impl ImageStage {
    /// Short name used in file names
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStage::First => "first",
            ImageStage::Zoom => "zoom",
        }
    }
}

/// Where rejected images were archived
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RejectedArchive {
    pub first: Option<PathBuf>,
    pub zoom: Option<PathBuf>,
}

/// Filesystem store for uploaded and rejected images
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    uploads_dir: PathBuf,
    rejected_dir: PathBuf,
}

impl EvidenceStore {
    /// Create the store, making sure every directory exists
    pub fn new(uploads_dir: PathBuf, rejected_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&uploads_dir)
            .with_context(|| format!("Failed to create uploads directory {:?}", uploads_dir))?;
        for stage in [ImageStage::First, ImageStage::Zoom] {
            let dir = rejected_dir.join(stage.as_str());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create archive directory {:?}", dir))?;
        }

        Ok(Self {
            uploads_dir,
            rejected_dir,
        })
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn rejected_dir(&self) -> &Path {
        &self.rejected_dir
    }

    /// Directory holding every file of one case
    pub fn case_dir(&self, case_id: &Uuid) -> PathBuf {
        self.uploads_dir.join(case_id.to_string())
    }

    /// Fresh path for a plate crop of a case
    pub fn new_crop_path(&self, case_id: &Uuid) -> PathBuf {
        self.case_dir(case_id)
            .join(format!("plate_crop_{}.jpg", file_token()))
    }

    /// Write uploaded bytes as `<case dir>/<stage>_<token>.<ext>`.
    ///
    /// The extension follows the detected image format. Each call writes a
    /// new file; the caller removes uploads it replaces.
    pub fn save_upload(&self, case_id: &Uuid, stage: ImageStage, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.case_dir(case_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create case directory {:?}", dir))?;

        let path = dir.join(format!(
            "{}_{}.{}",
            stage.as_str(),
            file_token(),
            upload_extension(bytes)
        ));
        std::fs::write(&path, bytes).with_context(|| format!("Failed to write upload {:?}", path))?;

        debug!("Stored {} image for case {} at {:?}", stage.as_str(), case_id, path);
        Ok(path)
    }

    /// Delete a case directory. A missing directory is not an error.
    pub fn discard_case(&self, case_id: &Uuid) -> Result<()> {
        let dir = self.case_dir(case_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("Discarded case directory {:?}", dir);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", dir)),
        }
    }

    /// Delete a single file, ignoring a missing one
    pub fn remove_file(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
        }
    }

    /// True when `path` resolves to an existing file inside the uploads
    /// directory
    pub fn is_within_uploads(&self, path: &Path) -> bool {
        let (Ok(root), Ok(target)) = (self.uploads_dir.canonicalize(), path.canonicalize()) else {
            return false;
        };
        target != root && target.starts_with(&root) && target.is_file()
    }

    /// Copy rejected images into the archive.
    ///
    /// Names are `rejected_<stage>_<YYYYmmdd_HHMMSS>[_<tag>].<ext>`. Paths
    /// that do not exist are skipped and reported as `None`.
    pub fn archive_rejected(
        &self,
        first: Option<&Path>,
        zoom: Option<&Path>,
        tag: Option<&str>,
    ) -> Result<RejectedArchive> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();

        Ok(RejectedArchive {
            first: self.archive_one(ImageStage::First, first, &stamp, tag)?,
            zoom: self.archive_one(ImageStage::Zoom, zoom, &stamp, tag)?,
        })
    }

    fn archive_one(
        &self,
        stage: ImageStage,
        source: Option<&Path>,
        stamp: &str,
        tag: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        let Some(source) = source else {
            return Ok(None);
        };
        if !source.is_file() {
            warn!("Rejected {} image {:?} no longer exists", stage.as_str(), source);
            return Ok(None);
        }

        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(FALLBACK_EXTENSION);
        let stem = match tag {
            Some(tag) => format!("rejected_{}_{}_{}", stage.as_str(), stamp, tag),
            None => format!("rejected_{}_{}", stage.as_str(), stamp),
        };
        let dest = unique_destination(&self.rejected_dir.join(stage.as_str()), &stem, ext);

        std::fs::copy(source, &dest)
            .with_context(|| format!("Failed to archive {:?} to {:?}", source, dest))?;
        info!("Archived rejected {} image to {:?}", stage.as_str(), dest);

        Ok(Some(dest))
    }
}

/// Short random token keeping file names within a case distinct
fn file_token() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// File extension for uploaded bytes based on their magic number
fn upload_extension(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or(FALLBACK_EXTENSION)
}

/// `<dir>/<stem>.<ext>`, or `<stem>_<n>.<ext>` if that name is taken
fn unique_destination(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let candidate = dir.join(format!("{}.{}", stem, ext));
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(format!("{}_{}.{}", stem, n, ext)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
