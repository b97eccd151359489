//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::storage::is_constraint_violation;
use crate::workflow::{CaseError, WorkflowError};

/// Errors returned by handlers, rendered as `{"error": "..."}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Gone(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if is_constraint_violation(&err) {
            return ApiError::Conflict(format!("{:#}", err));
        }
        error!("Request failed: {:#}", err);
        ApiError::Internal(format!("{:#}", err))
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        let message = err.to_string();
        match err {
            WorkflowError::InvalidImage(_) | WorkflowError::ForeignImage(_) => {
                ApiError::BadRequest(message)
            }
            WorkflowError::Case(CaseError::Unknown(_)) | WorkflowError::UnknownViolationType(_) => {
                ApiError::NotFound(message)
            }
            WorkflowError::Case(CaseError::Expired(_)) => ApiError::Gone(message),
            WorkflowError::ViolationTypeMismatch { .. }
            | WorkflowError::NotReadyToConfirm(_)
            | WorkflowError::UnregisteredViolationClass(_) => ApiError::Conflict(message),
            WorkflowError::Internal(inner) => ApiError::from(inner),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
