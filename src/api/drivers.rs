//! Registry routes: drivers, violation types and recorded detections

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::{blocking, ApiError, AppState};
use crate::analysis::plate::is_canonical;
use crate::storage::{DetectionRecord, Driver, NewDriver, NewViolationType, ViolationType};

pub async fn get_driver(
    State(state): State<Arc<AppState>>,
    Path(plate): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let db = state.workflow.db().clone();
    let driver = blocking(move || Ok(db.driver_by_plate(&plate)?)).await?;

    Ok(Json(match driver {
        Some(driver) => serde_json::to_value(driver).map_err(anyhow::Error::from)?,
        None => json!({ "error": "Driver not found" }),
    }))
}

pub async fn add_driver(
    State(state): State<Arc<AppState>>,
    Json(driver): Json<NewDriver>,
) -> Result<Json<Value>, ApiError> {
    if !is_canonical(&driver.plate) {
        // Zoom images only ever match canonical plates
        warn!("Registering non-canonical plate {:?}", driver.plate);
    }

    let db = state.workflow.db().clone();
    let id = blocking(move || Ok(db.insert_driver(&driver)?)).await?;
    info!("Registered driver {}", id);

    Ok(Json(json!({ "message": "Vozac uspješno dodan.", "vozac_id": id })))
}

pub async fn add_violation_type(
    State(state): State<Arc<AppState>>,
    Json(violation): Json<NewViolationType>,
) -> Result<Json<Value>, ApiError> {
    let db = state.workflow.db().clone();
    let id = blocking(move || Ok(db.insert_violation_type(&violation)?)).await?;

    Ok(Json(json!({ "message": "Prekrsaj dodan.", "prekrsaj_id": id })))
}

pub async fn list_drivers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Driver>>, ApiError> {
    let db = state.workflow.db().clone();
    Ok(Json(blocking(move || Ok(db.list_drivers()?)).await?))
}

pub async fn list_violation_types(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ViolationType>>, ApiError> {
    let db = state.workflow.db().clone();
    Ok(Json(blocking(move || Ok(db.list_violation_types()?)).await?))
}

pub async fn list_detections(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DetectionRecord>>, ApiError> {
    let db = state.workflow.db().clone();
    Ok(Json(blocking(move || Ok(db.list_detections()?)).await?))
}
