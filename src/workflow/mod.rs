//! Two-phase violation workflow
//!
//! An officer first photographs the parked vehicle. When the detector sees a
//! registered violation a case is opened and the officer is asked for a
//! close-up of the plate. The zoom image is cropped, read and matched to a
//! registered driver, and the officer then confirms or rejects the case.
//!
//! Every method here blocks (inference, file and database work). The HTTP
//! layer runs them on the blocking thread pool.

pub mod session;

use image::DynamicImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::{UnknownClassPolicy, ViolationPolicy};
use crate::config::{OcrSettings, WorkflowSettings};
use crate::storage::database::now_timestamp;
use crate::storage::{
    Database, DetectionRecord, Driver, EvidenceStore, ImageStage, NewDetection,
};
use crate::vision::ocr::read_plate_image;
use crate::vision::{crop_plate, crop_region, read_plate, Detection, ObjectDetector, TextRecognizer};

pub use session::{Case, CaseError, CaseStage, CaseStore};

/// Plate reported when the crop could not be read
pub const UNKNOWN_PLATE: &str = "Unknown";

/// Plate reported by `/detect_plate` when recognition fails
pub const PLATE_NOT_READ: &str = "Not detected";

const MSG_NO_VIOLATION: &str = "Nema prekršaja: pravilno parkirano.";
const MSG_UNREGISTERED_CLASS: &str = "Nema prekršaja: klasa nije u bazi.";
const MSG_NEEDS_ZOOM: &str = "Približi se da očitamo tablicu.";
pub const MSG_CONFIRMED: &str = "Prekršaj evidentiran.";
const MSG_REJECTED: &str = "Odbijene slike sačuvane za treniranje.";

/// Workflow failures that callers can act on
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Uploaded file is not a readable image: {0}")]
    InvalidImage(String),

    #[error(transparent)]
    Case(#[from] CaseError),

    #[error("Violation type {given} does not match the session's violation type {expected}")]
    ViolationTypeMismatch { expected: i64, given: i64 },

    #[error("Session {0} has no matched driver to confirm")]
    NotReadyToConfirm(Uuid),

    #[error("Violation type {0} not found")]
    UnknownViolationType(i64),

    #[error("Detected class {0} is not a registered violation type")]
    UnregisteredViolationClass(String),

    #[error("Image {0:?} is not an uploaded file")]
    ForeignImage(PathBuf),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Result of analyzing the first image
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirstImageOutcome {
    Ok {
        message: String,
    },
    NeedsZoom {
        session_id: Uuid,
        prekrsaj_id: i64,
        detected_violation: String,
        message: String,
    },
}

/// Result of analyzing a zoom image
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoomImageOutcome {
    NoPlate {
        session_id: Uuid,
    },
    NoDriver {
        session_id: Uuid,
        plate: String,
    },
    ReadyToConfirm {
        session_id: Uuid,
        plate: String,
        vozac: Driver,
        prekrsaj_id: i64,
        prekrsaj_opis: String,
        prekrsaj_kazna: i64,
        slika1: String,
        slika2: String,
    },
}

/// Terminal case status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClosedStatus {
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Confirmation {
    pub status: ClosedStatus,
    pub message: String,
    /// Plate read from the zoom image
    pub plate: String,
    pub detection: DetectionRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub status: ClosedStatus,
    pub message: String,
    pub archived_first: Option<String>,
    pub archived_zoom: Option<String>,
}

/// What to reject
#[derive(Debug, Clone, PartialEq)]
pub enum RejectTarget {
    /// An open case; its files are archived and deleted
    Case(Uuid),
    /// Loose upload paths; archived only
    Files {
        first: Option<PathBuf>,
        zoom: Option<PathBuf>,
    },
}

/// Plate lookup without a case
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateDetection {
    pub plate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f32; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The violation review workflow and the resources it drives
pub struct ViolationWorkflow {
    detector: Arc<dyn ObjectDetector>,
    recognizer: Arc<dyn TextRecognizer>,
    db: Database,
    evidence: EvidenceStore,
    cases: CaseStore,
    policy: ViolationPolicy,
    crop_margin: u32,
    upscale: f32,
}

impl ViolationWorkflow {
    pub fn new(
        detector: Arc<dyn ObjectDetector>,
        recognizer: Arc<dyn TextRecognizer>,
        db: Database,
        evidence: EvidenceStore,
        workflow: &WorkflowSettings,
        ocr: &OcrSettings,
    ) -> Self {
        Self {
            detector,
            recognizer,
            db,
            evidence,
            cases: CaseStore::new(Duration::from_secs(workflow.session_ttl_secs)),
            policy: ViolationPolicy::from(workflow),
            crop_margin: workflow.crop_margin,
            upscale: ocr.upscale,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn cases(&self) -> &CaseStore {
        &self.cases
    }

    /// Check the wide shot for a registered violation.
    ///
    /// Files are only kept when a case is opened.
    pub fn analyze_first_image(&self, bytes: &[u8]) -> WorkflowResult<FirstImageOutcome> {
        let image = decode_upload(bytes)?;
        let detections = self.detector.detect(&image)?;

        let Some(found) = self.policy.find_violation(&detections) else {
            debug!("No violation class among {} detections", detections.len());
            return Ok(FirstImageOutcome::Ok {
                message: MSG_NO_VIOLATION.to_string(),
            });
        };

        let Some(violation) = self.db.violation_type_by_description(&found.class_name)? else {
            return match self.policy.unknown_class {
                UnknownClassPolicy::TreatAsCompliant => {
                    warn!("Detected class {} has no violation type, treating as compliant", found.class_name);
                    Ok(FirstImageOutcome::Ok {
                        message: MSG_UNREGISTERED_CLASS.to_string(),
                    })
                }
                UnknownClassPolicy::Reject => {
                    Err(WorkflowError::UnregisteredViolationClass(found.class_name.clone()))
                }
            };
        };

        let case_id = Uuid::new_v4();
        let first_image = self.evidence.save_upload(&case_id, ImageStage::First, bytes)?;
        let detected_violation = found.class_name.clone();
        let violation_id = violation.id;
        self.cases.open(Case::new(case_id, violation, first_image));

        info!("Opened case {} for {}", case_id, detected_violation);
        Ok(FirstImageOutcome::NeedsZoom {
            session_id: case_id,
            prekrsaj_id: violation_id,
            detected_violation,
            message: MSG_NEEDS_ZOOM.to_string(),
        })
    }

    /// Read the plate on a close-up and match it to a registered driver.
    ///
    /// The case stays open on `NO_PLATE` and `NO_DRIVER` so the officer can
    /// retake the zoom image. Each attempt stores its own zoom image and
    /// crop; the ones it replaces are deleted.
    pub fn analyze_zoom_image(
        &self,
        session_id: Uuid,
        violation_id: Option<i64>,
        bytes: &[u8],
    ) -> WorkflowResult<ZoomImageOutcome> {
        let image = decode_upload(bytes)?;
        let mut case = self.cases.get(&session_id)?;

        if let Some(given) = violation_id {
            if given != case.violation.id {
                return Err(WorkflowError::ViolationTypeMismatch {
                    expected: case.violation.id,
                    given,
                });
            }
        }

        let zoom_image = self.evidence.save_upload(&case.id, ImageStage::Zoom, bytes)?;
        case.zoom_image = Some(zoom_image.clone());
        case.plate_crop = None;
        case.stage = CaseStage::AwaitingZoom;

        match self.evaluate_zoom(&mut case, &image, &zoom_image) {
            Ok(outcome) => {
                self.store_case(case)?;
                Ok(outcome)
            }
            Err(e) => {
                self.remove_case_files(&case);
                Err(e)
            }
        }
    }

    /// Detect, crop and read the plate of a freshly stored zoom image,
    /// advancing `case` accordingly
    fn evaluate_zoom(
        &self,
        case: &mut Case,
        image: &DynamicImage,
        zoom_image: &Path,
    ) -> WorkflowResult<ZoomImageOutcome> {
        let session_id = case.id;
        let detections = self.detector.detect(image)?;
        let Some(plate_box) = self.policy.find_plate(&detections).map(|d| d.bbox) else {
            debug!("Case {}: no plate in zoom image", session_id);
            return Ok(ZoomImageOutcome::NoPlate { session_id });
        };

        let crop_path = self.evidence.new_crop_path(&session_id);
        case.plate_crop = crop_plate(zoom_image, &plate_box, self.crop_margin, &crop_path);

        let plate = match &case.plate_crop {
            Some(crop) => read_plate(self.recognizer.as_ref(), crop, self.upscale)?,
            None => None,
        }
        .unwrap_or_else(|| UNKNOWN_PLATE.to_string());

        let driver = if plate == UNKNOWN_PLATE {
            None
        } else {
            self.db.driver_by_plate(&plate)?
        };
        let Some(driver) = driver else {
            info!("Case {}: plate {} has no registered driver", session_id, plate);
            return Ok(ZoomImageOutcome::NoDriver { session_id, plate });
        };

        let violation = self
            .db
            .violation_type_by_id(case.violation.id)?
            .ok_or(WorkflowError::UnknownViolationType(case.violation.id))?;

        let outcome = ZoomImageOutcome::ReadyToConfirm {
            session_id,
            plate: plate.clone(),
            vozac: driver.clone(),
            prekrsaj_id: violation.id,
            prekrsaj_opis: violation.description.clone(),
            prekrsaj_kazna: violation.fine,
            slika1: path_string(&case.first_image),
            slika2: path_string(zoom_image),
        };

        case.violation = violation;
        case.stage = CaseStage::ReadyToConfirm { driver, plate };

        info!("Case {}: ready to confirm", session_id);
        Ok(outcome)
    }

    /// Save case progress and delete the files it replaced. If the case was
    /// closed meanwhile, the files of this attempt are deleted instead.
    fn store_case(&self, case: Case) -> WorkflowResult<()> {
        let attempt = case.clone();
        match self.cases.update(case) {
            Ok(replaced) => {
                for path in replaced {
                    self.remove_quietly(&path);
                }
                Ok(())
            }
            Err(e) => {
                self.remove_case_files(&attempt);
                Err(e.into())
            }
        }
    }

    fn remove_case_files(&self, case: &Case) {
        for path in case.zoom_image.iter().chain(case.plate_crop.iter()) {
            self.remove_quietly(path);
        }
    }

    fn remove_quietly(&self, path: &Path) {
        if let Err(e) = self.evidence.remove_file(path) {
            warn!("{:#}", e);
        }
    }

    /// Record the violation of a case that is ready to confirm and close it.
    /// Evidence images are kept; the plate crop is removed.
    ///
    /// The case is taken out of the store before the insert, so concurrent
    /// confirms or rejects of one case cannot both succeed.
    pub fn confirm(&self, session_id: Uuid) -> WorkflowResult<Confirmation> {
        let case = self
            .cases
            .take_ready(&session_id)?
            .ok_or(WorkflowError::NotReadyToConfirm(session_id))?;
        let matched = match &case.stage {
            CaseStage::ReadyToConfirm { driver, plate } => Some((driver.id, plate.clone())),
            CaseStage::AwaitingZoom => None,
        };
        let Some((driver_id, plate)) = matched else {
            self.cases.reopen(case);
            return Err(WorkflowError::NotReadyToConfirm(session_id));
        };

        let detection = NewDetection {
            driver_id,
            violation_type_id: case.violation.id,
            first_image: path_string(&case.first_image),
            zoom_image: case.zoom_image.as_deref().map(path_string),
        };
        let record = match self.db.insert_detection(&detection, &now_timestamp()) {
            Ok(record) => record,
            Err(e) => {
                self.cases.reopen(case);
                return Err(e.into());
            }
        };

        if let Some(crop) = &case.plate_crop {
            self.remove_quietly(crop);
        }

        info!("Case {} confirmed as detection {}", session_id, record.id);
        Ok(Confirmation {
            status: ClosedStatus::Confirmed,
            message: MSG_CONFIRMED.to_string(),
            plate,
            detection: record,
        })
    }

    /// Insert a detection directly, without a case
    pub fn record(&self, detection: &NewDetection) -> WorkflowResult<DetectionRecord> {
        Ok(self.db.insert_detection(detection, &now_timestamp())?)
    }

    /// Archive rejected images for retraining. Nothing is written to the
    /// database.
    pub fn reject(&self, target: RejectTarget) -> WorkflowResult<Rejection> {
        let archive = match target {
            RejectTarget::Case(session_id) => {
                let case = self.cases.take(&session_id)?;
                let archived = self.evidence.archive_rejected(
                    Some(case.first_image.as_path()),
                    case.zoom_image.as_deref(),
                    Some(case.short_id().as_str()),
                );
                let archive = match archived {
                    Ok(archive) => archive,
                    Err(e) => {
                        self.cases.reopen(case);
                        return Err(e.into());
                    }
                };

                self.evidence.discard_case(&session_id)?;
                info!("Case {} rejected", session_id);
                archive
            }
            RejectTarget::Files { first, zoom } => {
                for path in first.iter().chain(zoom.iter()) {
                    if path.exists() && !self.evidence.is_within_uploads(path) {
                        return Err(WorkflowError::ForeignImage(path.clone()));
                    }
                }
                self.evidence
                    .archive_rejected(first.as_deref(), zoom.as_deref(), None)?
            }
        };

        Ok(Rejection {
            status: ClosedStatus::Rejected,
            message: MSG_REJECTED.to_string(),
            archived_first: archive.first.as_deref().map(path_string),
            archived_zoom: archive.zoom.as_deref().map(path_string),
        })
    }

    /// Raw detector output for an uploaded image
    pub fn detect(&self, bytes: &[u8]) -> WorkflowResult<Vec<Detection>> {
        let image = decode_upload(bytes)?;
        Ok(self.detector.detect(&image)?)
    }

    /// Find and read the plate in an uploaded image, without opening a case
    pub fn detect_plate(&self, bytes: &[u8]) -> WorkflowResult<PlateDetection> {
        let image = decode_upload(bytes)?;
        let detections = self.detector.detect(&image)?;

        let Some(plate_box) = self.policy.find_plate(&detections).map(|d| d.bbox) else {
            return Ok(PlateDetection {
                plate: None,
                bbox: None,
                error: Some("Plate not detected".to_string()),
            });
        };

        let crop = crop_region(&image, &plate_box, self.crop_margin);
        let plate = if crop.width() == 0 || crop.height() == 0 {
            None
        } else {
            read_plate_image(self.recognizer.as_ref(), &crop, self.upscale)?
        };

        Ok(PlateDetection {
            plate: Some(plate.unwrap_or_else(|| PLATE_NOT_READ.to_string())),
            bbox: Some(plate_box.to_array()),
            error: None,
        })
    }

    /// Drop expired cases and delete their files
    pub fn expire_stale_cases(&self) -> usize {
        let expired = self.cases.sweep_expired();
        for case in &expired {
            if let Err(e) = self.evidence.discard_case(&case.id) {
                warn!("Failed to clean up expired case {}: {:#}", case.id, e);
            }
        }
        if !expired.is_empty() {
            info!(
                "Expired {} stale case(s), {} still open",
                expired.len(),
                self.cases.len()
            );
        }
        expired.len()
    }
}

/// Decode an uploaded image, rejecting anything the image crate cannot read
pub fn decode_upload(bytes: &[u8]) -> WorkflowResult<DynamicImage> {
    if bytes.is_empty() {
        return Err(WorkflowError::InvalidImage("empty upload".to_string()));
    }
    image::load_from_memory(bytes).map_err(|e| WorkflowError::InvalidImage(e.to_string()))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::TIMESTAMP_FORMAT;
    use crate::storage::{NewDriver, NewViolationType};
    use crate::vision::BoundingBox;
    use crate::vision::testing::{FixedRecognizer, ScriptedDetector};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        workflow: ViolationWorkflow,
        driver_id: i64,
        violation_id: i64,
    }

    fn det(class: &str, bbox: BoundingBox) -> Detection {
        Detection {
            class_name: class.to_string(),
            bbox,
            confidence: 0.9,
        }
    }

    fn violation_det() -> Detection {
        det("NepropisnoParkiranoTrotoar", BoundingBox::new(10.0, 10.0, 150.0, 90.0))
    }

    fn plate_det() -> Detection {
        det("tablica", BoundingBox::new(60.0, 40.0, 120.0, 60.0))
    }

    fn png_bytes() -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([120, 120, 120])))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn fixture_with(
        script: Vec<Vec<Detection>>,
        plate_text: &'static str,
        settings: WorkflowSettings,
    ) -> Fixture {
        let dir = tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();

        let driver_id = db
            .insert_driver(&NewDriver {
                name: "Amra".to_string(),
                plate: "A12-K-345".to_string(),
                vehicle_type: "putnicko".to_string(),
                invalid_permit: false,
                reservation: false,
            })
            .unwrap();
        let violation_id = db
            .insert_violation_type(&NewViolationType {
                description: "NepropisnoParkiranoTrotoar".to_string(),
                fine: 50,
            })
            .unwrap();

        let evidence =
            EvidenceStore::new(dir.path().join("uploads"), dir.path().join("rejected")).unwrap();

        let workflow = ViolationWorkflow::new(
            Arc::new(ScriptedDetector::new(script)),
            Arc::new(FixedRecognizer(plate_text)),
            db,
            evidence,
            &settings,
            &OcrSettings::default(),
        );

        Fixture {
            dir,
            workflow,
            driver_id,
            violation_id,
        }
    }

    fn fixture(script: Vec<Vec<Detection>>, plate_text: &'static str) -> Fixture {
        fixture_with(script, plate_text, WorkflowSettings::default())
    }

    fn open_case(f: &Fixture) -> Uuid {
        match f.workflow.analyze_first_image(&png_bytes()).unwrap() {
            FirstImageOutcome::NeedsZoom { session_id, .. } => session_id,
            other => panic!("expected NEEDS_ZOOM, got {:?}", other),
        }
    }

    /// File names in a case directory, sorted
    fn case_files(f: &Fixture, id: &Uuid) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(f.workflow.evidence.case_dir(id))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn ready_case(f: &Fixture) -> Uuid {
        let session_id = open_case(f);
        let zoom = f.workflow.analyze_zoom_image(session_id, None, &png_bytes()).unwrap();
        assert!(matches!(zoom, ZoomImageOutcome::ReadyToConfirm { .. }));
        session_id
    }

    fn uploads_is_empty(f: &Fixture) -> bool {
        std::fs::read_dir(f.workflow.evidence.uploads_dir())
            .unwrap()
            .next()
            .is_none()
    }

    #[test]
    fn test_first_image_without_violation_is_ok() {
        let f = fixture(vec![vec![det("PropisnoParkirano", BoundingBox::new(0.0, 0.0, 5.0, 5.0))]], "");

        let outcome = f.workflow.analyze_first_image(&png_bytes()).unwrap();
        assert!(matches!(outcome, FirstImageOutcome::Ok { .. }));
        assert!(f.workflow.cases().is_empty());
        assert!(uploads_is_empty(&f));
    }

    #[test]
    fn test_unregistered_class_fails_open() {
        let f = fixture(
            vec![vec![det("NepropisnoParkiranoInvalid", BoundingBox::new(0.0, 0.0, 5.0, 5.0))]],
            "",
        );

        let outcome = f.workflow.analyze_first_image(&png_bytes()).unwrap();
        assert_eq!(
            outcome,
            FirstImageOutcome::Ok {
                message: MSG_UNREGISTERED_CLASS.to_string()
            }
        );
        assert!(uploads_is_empty(&f));
    }

    #[test]
    fn test_unregistered_class_with_reject_policy() {
        let settings = WorkflowSettings {
            unknown_class_policy: UnknownClassPolicy::Reject,
            ..WorkflowSettings::default()
        };
        let f = fixture_with(
            vec![vec![det("NepropisnoParkiranoInvalid", BoundingBox::new(0.0, 0.0, 5.0, 5.0))]],
            "",
            settings,
        );

        let err = f.workflow.analyze_first_image(&png_bytes()).unwrap_err();
        assert!(matches!(err, WorkflowError::UnregisteredViolationClass(c) if c == "NepropisnoParkiranoInvalid"));
    }

    #[test]
    fn test_invalid_upload() {
        let f = fixture(vec![], "");
        let err = f.workflow.analyze_first_image(b"definitely not a picture").unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidImage(_)));

        let err = f.workflow.detect(&[]).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidImage(_)));
    }

    #[test]
    fn test_full_confirm_flow() {
        let f = fixture(vec![vec![violation_det()], vec![plate_det()]], "a12k345");

        let first = f.workflow.analyze_first_image(&png_bytes()).unwrap();
        let FirstImageOutcome::NeedsZoom {
            session_id,
            prekrsaj_id,
            detected_violation,
            ..
        } = first
        else {
            panic!("expected NEEDS_ZOOM");
        };
        assert_eq!(prekrsaj_id, f.violation_id);
        assert_eq!(detected_violation, "NepropisnoParkiranoTrotoar");

        let zoom = f
            .workflow
            .analyze_zoom_image(session_id, Some(prekrsaj_id), &png_bytes())
            .unwrap();
        let ZoomImageOutcome::ReadyToConfirm {
            plate,
            vozac,
            prekrsaj_kazna,
            slika1,
            slika2,
            ..
        } = zoom
        else {
            panic!("expected READY_TO_CONFIRM, got {:?}", zoom);
        };
        assert_eq!(plate, "A12-K-345");
        assert_eq!(vozac.id, f.driver_id);
        assert_eq!(prekrsaj_kazna, 50);
        assert!(Path::new(&slika1).is_file());
        assert!(Path::new(&slika2).is_file());

        assert!(case_files(&f, &session_id)
            .iter()
            .any(|name| name.starts_with("plate_crop_")));

        let confirmation = f.workflow.confirm(session_id).unwrap();
        assert_eq!(confirmation.status, ClosedStatus::Confirmed);
        assert_eq!(confirmation.plate, "A12-K-345");
        assert_eq!(confirmation.detection.driver_id, f.driver_id);
        assert_eq!(confirmation.detection.zoom_image.as_deref(), Some(slika2.as_str()));

        assert_eq!(f.workflow.db().list_detections().unwrap().len(), 1);
        assert!(Path::new(&slika1).is_file());
        assert!(Path::new(&slika2).is_file());
        assert!(!case_files(&f, &session_id)
            .iter()
            .any(|name| name.starts_with("plate_crop_")));
        assert!(matches!(
            f.workflow.confirm(session_id).unwrap_err(),
            WorkflowError::Case(CaseError::Unknown(_))
        ));
    }

    #[test]
    fn test_confirm_records_current_time() {
        let f = fixture(vec![vec![violation_det()], vec![plate_det()]], "A12K345");
        let session_id = ready_case(&f);

        let confirmation = f.workflow.confirm(session_id).unwrap();
        let now = chrono::Local::now().naive_local();

        let recorded =
            chrono::NaiveDateTime::parse_from_str(&confirmation.detection.timestamp, TIMESTAMP_FORMAT)
                .unwrap();
        // Stored with whole seconds, so it may trail the clock by up to one
        let drift = (now - recorded).num_seconds();
        assert!((0..=1).contains(&drift), "timestamp off by {} s", drift);

        let rows = f.workflow.db().list_detections().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].driver_id, f.driver_id);
        assert_eq!(rows[0].violation_type_id, f.violation_id);
        assert_eq!(rows[0], confirmation.detection);
    }

    #[test]
    fn test_concurrent_confirms_record_once() {
        let f = fixture(vec![vec![violation_det()], vec![plate_det()]], "A12K345");
        let session_id = ready_case(&f);

        let barrier = std::sync::Barrier::new(8);
        let confirmed: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        f.workflow.confirm(session_id).is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(confirmed, 1);
        assert_eq!(f.workflow.db().list_detections().unwrap().len(), 1);
    }

    #[test]
    fn test_confirm_racing_reject_closes_once() {
        let f = fixture(vec![vec![violation_det()], vec![plate_det()]], "A12K345");
        let session_id = ready_case(&f);

        let barrier = std::sync::Barrier::new(2);
        let (confirmed, rejected) = std::thread::scope(|s| {
            let confirm = s.spawn(|| {
                barrier.wait();
                f.workflow.confirm(session_id).is_ok()
            });
            let reject = s.spawn(|| {
                barrier.wait();
                f.workflow.reject(RejectTarget::Case(session_id)).is_ok()
            });
            (confirm.join().unwrap(), reject.join().unwrap())
        });

        assert!(confirmed != rejected, "exactly one of confirm and reject wins");
        let rows = f.workflow.db().list_detections().unwrap();
        if confirmed {
            assert_eq!(rows.len(), 1);
            assert!(Path::new(&rows[0].first_image).is_file());
        } else {
            assert!(rows.is_empty());
        }
    }

    #[test]
    fn test_zoom_retries_keep_only_latest_files() {
        let f = fixture(
            vec![vec![violation_det()], vec![plate_det()], vec![plate_det()]],
            "E50K999",
        );
        let session_id = open_case(&f);

        for _ in 0..2 {
            let outcome = f.workflow.analyze_zoom_image(session_id, None, &png_bytes()).unwrap();
            assert!(matches!(outcome, ZoomImageOutcome::NoDriver { .. }));
        }

        let case = f.workflow.cases().get(&session_id).unwrap();
        let zoom = case.zoom_image.unwrap();
        let crop = case.plate_crop.unwrap();
        assert!(zoom.is_file());
        assert!(crop.is_file());

        let names = case_files(&f, &session_id);
        assert_eq!(names.len(), 3, "{:?}", names);
        assert_eq!(names.iter().filter(|n| n.starts_with("zoom_")).count(), 1);
        assert_eq!(names.iter().filter(|n| n.starts_with("plate_crop_")).count(), 1);
    }

    #[test]
    fn test_zoom_retry_after_no_plate() {
        let f = fixture(vec![vec![violation_det()], vec![], vec![plate_det()]], "A12K345");
        let session_id = open_case(&f);

        let first_try = f.workflow.analyze_zoom_image(session_id, None, &png_bytes()).unwrap();
        assert_eq!(first_try, ZoomImageOutcome::NoPlate { session_id });

        let second_try = f.workflow.analyze_zoom_image(session_id, None, &png_bytes()).unwrap();
        assert!(matches!(second_try, ZoomImageOutcome::ReadyToConfirm { .. }));
    }

    #[test]
    fn test_zoom_unregistered_plate() {
        let f = fixture(vec![vec![violation_det()], vec![plate_det()]], "E50 K 999");
        let session_id = open_case(&f);

        let outcome = f.workflow.analyze_zoom_image(session_id, None, &png_bytes()).unwrap();
        assert_eq!(
            outcome,
            ZoomImageOutcome::NoDriver {
                session_id,
                plate: "E50-K-999".to_string()
            }
        );

        // Still open, but not confirmable
        assert!(matches!(
            f.workflow.confirm(session_id).unwrap_err(),
            WorkflowError::NotReadyToConfirm(_)
        ));
    }

    #[test]
    fn test_zoom_unreadable_plate_is_unknown() {
        let f = fixture(vec![vec![violation_det()], vec![plate_det()]], "");
        let session_id = open_case(&f);

        let outcome = f.workflow.analyze_zoom_image(session_id, None, &png_bytes()).unwrap();
        assert_eq!(
            outcome,
            ZoomImageOutcome::NoDriver {
                session_id,
                plate: UNKNOWN_PLATE.to_string()
            }
        );
    }

    #[test]
    fn test_zoom_violation_mismatch() {
        let f = fixture(vec![vec![violation_det()]], "");
        let session_id = open_case(&f);

        let err = f
            .workflow
            .analyze_zoom_image(session_id, Some(f.violation_id + 7), &png_bytes())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ViolationTypeMismatch { .. }));
    }

    #[test]
    fn test_zoom_unknown_session() {
        let f = fixture(vec![], "");
        let id = Uuid::new_v4();
        let err = f.workflow.analyze_zoom_image(id, None, &png_bytes()).unwrap_err();
        assert!(matches!(err, WorkflowError::Case(CaseError::Unknown(x)) if x == id));
    }

    #[test]
    fn test_reject_case_archives_and_cleans_up() {
        let f = fixture(vec![vec![violation_det()], vec![plate_det()]], "A12K345");
        let session_id = open_case(&f);
        f.workflow.analyze_zoom_image(session_id, None, &png_bytes()).unwrap();

        let rejection = f.workflow.reject(RejectTarget::Case(session_id)).unwrap();
        assert_eq!(rejection.status, ClosedStatus::Rejected);

        let first = PathBuf::from(rejection.archived_first.unwrap());
        let zoom = PathBuf::from(rejection.archived_zoom.unwrap());
        assert!(first.is_file());
        assert!(zoom.is_file());
        assert!(first.to_string_lossy().contains(&session_id.simple().to_string()[..8]));

        assert!(f.workflow.db().list_detections().unwrap().is_empty());
        assert!(uploads_is_empty(&f));
        assert!(f.workflow.cases().is_empty());
    }

    #[test]
    fn test_reject_loose_files() {
        let f = fixture(vec![vec![violation_det()]], "");
        let session_id = open_case(&f);
        let first = f.workflow.cases().get(&session_id).unwrap().first_image;

        let rejection = f
            .workflow
            .reject(RejectTarget::Files {
                first: Some(first.clone()),
                zoom: Some(first.with_file_name("never_uploaded.jpg")),
            })
            .unwrap();

        assert!(rejection.archived_first.is_some());
        assert!(rejection.archived_zoom.is_none());
        // Loose rejection leaves the case alone
        assert!(first.is_file());
        assert!(f.workflow.cases().get(&session_id).is_ok());
    }

    #[test]
    fn test_reject_outside_uploads_is_refused() {
        let f = fixture(vec![], "");
        let outside = f.dir.path().join("notes.txt");
        std::fs::write(&outside, "private").unwrap();

        let err = f
            .workflow
            .reject(RejectTarget::Files {
                first: Some(outside),
                zoom: None,
            })
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ForeignImage(_)));
    }

    #[test]
    fn test_expired_case() {
        let settings = WorkflowSettings {
            session_ttl_secs: 0,
            ..WorkflowSettings::default()
        };
        let f = fixture_with(vec![vec![violation_det()]], "", settings);
        let session_id = open_case(&f);
        assert!(f.workflow.evidence.case_dir(&session_id).is_dir());

        let err = f.workflow.analyze_zoom_image(session_id, None, &png_bytes()).unwrap_err();
        assert!(matches!(err, WorkflowError::Case(CaseError::Expired(_))));

        assert_eq!(f.workflow.expire_stale_cases(), 1);
        assert!(!f.workflow.evidence.case_dir(&session_id).exists());
        assert!(matches!(
            f.workflow.confirm(session_id).unwrap_err(),
            WorkflowError::Case(CaseError::Expired(_))
        ));
    }

    #[test]
    fn test_record_direct() {
        let f = fixture(vec![], "");
        let record = f
            .workflow
            .record(&NewDetection {
                driver_id: f.driver_id,
                violation_type_id: f.violation_id,
                first_image: "first.jpg".to_string(),
                zoom_image: None,
            })
            .unwrap();
        assert_eq!(record.violation_type_id, f.violation_id);
    }

    #[test]
    fn test_detect_plate() {
        let f = fixture(vec![vec![], vec![plate_det()]], "a12k345");

        let missing = f.workflow.detect_plate(&png_bytes()).unwrap();
        assert_eq!(missing.plate, None);
        assert_eq!(missing.error.as_deref(), Some("Plate not detected"));

        let found = f.workflow.detect_plate(&png_bytes()).unwrap();
        assert_eq!(found.plate.as_deref(), Some("A12-K-345"));
        assert_eq!(found.bbox, Some([60.0, 40.0, 120.0, 60.0]));
        assert!(uploads_is_empty(&f));
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(FirstImageOutcome::Ok {
            message: "x".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "OK");

        let json = serde_json::to_value(ZoomImageOutcome::NoPlate {
            session_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["status"], "NO_PLATE");

        let json = serde_json::to_value(PlateDetection {
            plate: None,
            bbox: None,
            error: Some("Plate not detected".to_string()),
        })
        .unwrap();
        assert!(json["plate"].is_null());
        assert!(json.get("bbox").is_none());
    }
}
