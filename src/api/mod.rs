//! HTTP API
//!
//! JSON endpoints for driver and violation registries plus the multipart
//! image endpoints of the review workflow.

pub mod drivers;
pub mod error;
pub mod violations;

pub use error::ApiError;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::workflow::{ViolationWorkflow, WorkflowResult};

/// Application state shared across handlers
pub struct AppState {
    pub workflow: Arc<ViolationWorkflow>,
}

/// Build the router with every endpoint
pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        // Registries
        .route("/driver/:plate", get(drivers::get_driver))
        .route("/add_driver", post(drivers::add_driver))
        .route("/add_violation_type", post(drivers::add_violation_type))
        .route("/vozaci", get(drivers::list_drivers))
        .route("/prekrsaji", get(drivers::list_violation_types))
        .route("/detektovano", get(drivers::list_detections))
        // Detection
        .route("/detect", post(violations::detect))
        .route("/detect_plate", post(violations::detect_plate))
        // Review workflow
        .route("/analyze_first_image", post(violations::analyze_first_image))
        .route("/analyze_zoom_image", post(violations::analyze_zoom_image))
        .route("/confirm_violation", post(violations::confirm_violation))
        .route("/record_violation", post(violations::record_violation))
        .route("/reject_violation", post(violations::reject_violation))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "AI Parking Agent backend is running!" }))
}

/// Run blocking work (database, files) off the async runtime
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("Worker task failed: {}", e)))?
}

/// Run a workflow step on the blocking pool
pub(crate) async fn run_workflow<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&ViolationWorkflow) -> WorkflowResult<T> + Send + 'static,
    T: Send + 'static,
{
    let workflow = state.workflow.clone();
    blocking(move || f(workflow.as_ref()).map_err(ApiError::from)).await
}

/// Multipart form with one `file` part and optional text fields
pub(crate) struct Upload {
    pub file: Bytes,
    fields: HashMap<String, String>,
}

impl Upload {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

pub(crate) async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut file = None;
    let mut fields = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        if name == "file" {
            file = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read upload: {}", e)))?,
            );
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(format!("Failed to read field {}: {}", name, e)))?;
            fields.insert(name, value.trim().to_string());
        }
    }

    let file = file.ok_or_else(|| ApiError::BadRequest("Missing file".to_string()))?;
    Ok(Upload { file, fields })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OcrSettings, WorkflowSettings};
    use crate::storage::{Database, EvidenceStore};
    use crate::vision::testing::{FixedRecognizer, ScriptedDetector};
    use crate::vision::{BoundingBox, Detection};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    const BOUNDARY: &str = "parkingtestboundary";

    fn test_app(script: Vec<Vec<Detection>>, plate: &'static str, settings: WorkflowSettings) -> (TempDir, Router) {
        let dir = tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();
        let evidence =
            EvidenceStore::new(dir.path().join("uploads"), dir.path().join("rejected")).unwrap();

        let workflow = ViolationWorkflow::new(
            Arc::new(ScriptedDetector::new(script)),
            Arc::new(FixedRecognizer(plate)),
            db,
            evidence,
            &settings,
            &OcrSettings::default(),
        );
        let state = Arc::new(AppState {
            workflow: Arc::new(workflow),
        });

        (dir, router(state, 1024 * 1024))
    }

    fn png_bytes() -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([90, 90, 90])))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn multipart_request(uri: &str, file: &[u8], fields: &[(&str, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"photo.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn det(class: &str, bbox: BoundingBox) -> Detection {
        Detection {
            class_name: class.to_string(),
            bbox,
            confidence: 0.8,
        }
    }

    async fn seed(app: &Router) {
        let (status, _) = send(
            app,
            json_request(
                "/add_driver",
                json!({"ime": "Amra", "tablica": "A12-K-345", "auto_tip": "putnicko"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            app,
            json_request(
                "/add_violation_type",
                json!({"opis": "NepropisnoParkiranoTrotoar", "kazna": 50}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["prekrsaj_id"], 1);
    }

    #[tokio::test]
    async fn test_root() {
        let (_dir, app) = test_app(vec![], "", WorkflowSettings::default());
        let (status, body) = send(&app, Request::get("/").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_driver_registry() {
        let (_dir, app) = test_app(vec![], "", WorkflowSettings::default());
        seed(&app).await;

        let (status, body) =
            send(&app, Request::get("/driver/A12-K-345").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ime"], "Amra");
        assert_eq!(body["rezervacija"], false);

        let (status, body) =
            send(&app, Request::get("/driver/E50-K-999").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], "Driver not found");

        let (status, body) = send(
            &app,
            json_request(
                "/add_driver",
                json!({"ime": "Haris", "tablica": "A12-K-345", "auto_tip": "kombi"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].is_string());

        let (_, drivers) = send(&app, Request::get("/vozaci").body(Body::empty()).unwrap()).await;
        assert_eq!(drivers.as_array().unwrap().len(), 1);

        let (_, violations) =
            send(&app, Request::get("/prekrsaji").body(Body::empty()).unwrap()).await;
        assert_eq!(violations[0]["kazna"], 50);
    }

    #[tokio::test]
    async fn test_review_flow_over_http() {
        let script = vec![
            vec![det("NepropisnoParkiranoTrotoar", BoundingBox::new(0.0, 0.0, 150.0, 90.0))],
            vec![det("tablica", BoundingBox::new(60.0, 40.0, 120.0, 60.0))],
        ];
        let (_dir, app) = test_app(script, "A12K345", WorkflowSettings::default());
        seed(&app).await;

        let (status, first) =
            send(&app, multipart_request("/analyze_first_image", &png_bytes(), &[])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "NEEDS_ZOOM");
        let session_id = first["session_id"].as_str().unwrap().to_string();

        let (status, zoom) = send(
            &app,
            multipart_request(
                "/analyze_zoom_image",
                &png_bytes(),
                &[("session_id", &session_id), ("prekrsaj_id", "1")],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(zoom["status"], "READY_TO_CONFIRM");
        assert_eq!(zoom["vozac"]["tablica"], "A12-K-345");
        assert_eq!(zoom["prekrsaj_kazna"], 50);

        let (status, confirmed) = send(
            &app,
            json_request("/confirm_violation", json!({ "session_id": session_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(confirmed["status"], "CONFIRMED");
        assert_eq!(confirmed["plate"], "A12-K-345");
        assert_eq!(confirmed["detection"]["vozac_id"], 1);

        let (_, detections) =
            send(&app, Request::get("/detektovano").body(Body::empty()).unwrap()).await;
        assert_eq!(detections.as_array().unwrap().len(), 1);

        let (status, _) = send(
            &app,
            json_request("/confirm_violation", json!({ "session_id": session_id })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_expired_session_is_gone() {
        let settings = WorkflowSettings {
            session_ttl_secs: 0,
            ..WorkflowSettings::default()
        };
        let script = vec![vec![det(
            "NepropisnoParkiranoTrotoar",
            BoundingBox::new(0.0, 0.0, 50.0, 50.0),
        )]];
        let (_dir, app) = test_app(script, "", settings);
        seed(&app).await;

        let (_, first) =
            send(&app, multipart_request("/analyze_first_image", &png_bytes(), &[])).await;
        let session_id = first["session_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            multipart_request("/analyze_zoom_image", &png_bytes(), &[("session_id", &session_id)]),
        )
        .await;
        assert_eq!(status, StatusCode::GONE);
        assert!(body["error"].as_str().unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn test_bad_uploads() {
        let (_dir, app) = test_app(vec![], "", WorkflowSettings::default());

        let (status, _) =
            send(&app, multipart_request("/analyze_first_image", b"not an image", &[])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            multipart_request("/analyze_zoom_image", &png_bytes(), &[("session_id", "nope")]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            multipart_request(
                "/analyze_zoom_image",
                &png_bytes(),
                &[("session_id", &uuid::Uuid::new_v4().to_string())],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_detect_endpoints() {
        let script = vec![
            vec![det("tablica", BoundingBox::new(60.0, 40.0, 120.0, 60.0))],
            vec![],
        ];
        let (_dir, app) = test_app(script, "", WorkflowSettings::default());

        let (status, body) = send(&app, multipart_request("/detect", &png_bytes(), &[])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detections"][0]["class"], "tablica");
        assert_eq!(body["detections"][0]["box"][2], 120.0);

        let (status, body) =
            send(&app, multipart_request("/detect_plate", &png_bytes(), &[])).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["plate"].is_null());
        assert_eq!(body["error"], "Plate not detected");
    }

    #[tokio::test]
    async fn test_reject_requires_target() {
        let (_dir, app) = test_app(vec![], "", WorkflowSettings::default());
        let (status, _) = send(&app, json_request("/reject_violation", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
