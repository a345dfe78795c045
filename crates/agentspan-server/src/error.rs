//! Application error types and Axum response conversion.

use agentspan_core::JobStatus;
use agentspan_store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::validate::FieldError;

/// Application-level errors with HTTP status code mapping.
#[derive(Debug)]
pub enum AppError {
    /// The request body failed validation.
    Validation(Vec<FieldError>),
    BadRequest(String),
    NotFound(String),
    /// The job exists but has no result yet.
    NotReady { job_id: String, status: JobStatus },
    /// The job store or queue cannot be reached.
    Unavailable(String),
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AppError::NotFound(format!("job {id} not found")),
            e if e.is_infrastructure() => {
                tracing::error!(error = %e, "Job store unavailable");
                AppError::Unavailable("job store unavailable".into())
            }
            e => AppError::Internal(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<JobStatus>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            fields: Vec::new(),
            status: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (code, body) = match self {
            AppError::Validation(fields) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    fields,
                    ..ErrorResponse::new("invalid trace batch")
                },
            ),
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, ErrorResponse::new(message)),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, ErrorResponse::new(message)),
            AppError::NotReady { job_id, status } => (
                StatusCode::CONFLICT,
                ErrorResponse {
                    status: Some(status),
                    ..ErrorResponse::new(format!("job {job_id} is still {status}"))
                },
            ),
            AppError::Unavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, ErrorResponse::new(message))
            }
            AppError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::new(message))
            }
        };
        (code, Json(body)).into_response()
    }
}
