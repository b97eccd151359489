//! Image analysis and violation review routes

use axum::{
    extract::{Multipart, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::{read_upload, run_workflow, ApiError, AppState};
use crate::storage::NewDetection;
use crate::vision::Detection;
use crate::workflow::{
    Confirmation, FirstImageOutcome, PlateDetection, RejectTarget, Rejection, ZoomImageOutcome,
    MSG_CONFIRMED,
};

/// Detection as exposed by `/detect`
#[derive(Debug, Serialize)]
pub struct DetectionView {
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
}

impl From<Detection> for DetectionView {
    fn from(d: Detection) -> Self {
        Self {
            bbox: d.bbox.to_array(),
            class_name: d.class_name,
            confidence: d.confidence,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub session_id: Uuid,
}

/// Either a case id or loose upload paths
#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub session_id: Option<Uuid>,
    pub slika1: Option<String>,
    pub slika2: Option<String>,
}

pub async fn detect(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let upload = read_upload(multipart).await?;
    let detections = run_workflow(&state, move |w| w.detect(&upload.file)).await?;

    let views: Vec<DetectionView> = detections.into_iter().map(DetectionView::from).collect();
    Ok(Json(json!({ "detections": views })))
}

pub async fn detect_plate(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<PlateDetection>, ApiError> {
    let upload = read_upload(multipart).await?;
    Ok(Json(run_workflow(&state, move |w| w.detect_plate(&upload.file)).await?))
}

pub async fn analyze_first_image(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<FirstImageOutcome>, ApiError> {
    let upload = read_upload(multipart).await?;
    Ok(Json(
        run_workflow(&state, move |w| w.analyze_first_image(&upload.file)).await?,
    ))
}

pub async fn analyze_zoom_image(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<ZoomImageOutcome>, ApiError> {
    let upload = read_upload(multipart).await?;

    let session_id = upload
        .field("session_id")
        .ok_or_else(|| ApiError::BadRequest("Missing session_id".to_string()))?
        .parse::<Uuid>()
        .map_err(|e| ApiError::BadRequest(format!("Invalid session_id: {}", e)))?;
    let violation_id = upload
        .field("prekrsaj_id")
        .map(|v| {
            v.parse::<i64>()
                .map_err(|e| ApiError::BadRequest(format!("Invalid prekrsaj_id: {}", e)))
        })
        .transpose()?;

    Ok(Json(
        run_workflow(&state, move |w| {
            w.analyze_zoom_image(session_id, violation_id, &upload.file)
        })
        .await?,
    ))
}

pub async fn confirm_violation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<Confirmation>, ApiError> {
    Ok(Json(
        run_workflow(&state, move |w| w.confirm(request.session_id)).await?,
    ))
}

pub async fn record_violation(
    State(state): State<Arc<AppState>>,
    Json(detection): Json<NewDetection>,
) -> Result<Json<Value>, ApiError> {
    let record = run_workflow(&state, move |w| w.record(&detection)).await?;
    Ok(Json(json!({ "message": MSG_CONFIRMED, "detection": record })))
}

pub async fn reject_violation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<Rejection>, ApiError> {
    let target = match request {
        RejectRequest {
            session_id: Some(id),
            ..
        } => RejectTarget::Case(id),
        RejectRequest {
            slika1: None,
            slika2: None,
            ..
        } => {
            return Err(ApiError::BadRequest(
                "Expected session_id or slika1/slika2".to_string(),
            ))
        }
        RejectRequest { slika1, slika2, .. } => RejectTarget::Files {
            first: slika1.map(PathBuf::from),
            zoom: slika2.map(PathBuf::from),
        },
    };

    Ok(Json(run_workflow(&state, move |w| w.reject(target)).await?))
}
