//! Trace registration and job polling handlers.

use std::sync::Arc;

use agentspan_core::JobStatus;
use agentspan_store::JobQuery;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use tracing::{info, warn};

use crate::dto::{
    JobListResponse, JobResultResponse, JobStatusResponse, ListJobsQuery, RegisterResponse,
};
use crate::error::AppError;
use crate::state::AppState;
use crate::validate::validate_batch;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

/// POST /register-traces - Validate a trace batch and queue it.
pub async fn register(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let Json(body) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let batch = validate_batch(body).map_err(|errors| {
        warn!(errors = errors.len(), "Rejected trace batch");
        AppError::Validation(errors)
    })?;

    let job_id = state.queue.submit(&batch)?;

    let traces = batch.traces.len();
    info!(
        job_id = %job_id,
        agent_id = %batch.agent_id,
        session_id = %batch.session_id,
        traces,
        "Queued trace batch"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(RegisterResponse {
            job_id,
            status: JobStatus::Queued,
            message: format!("Trace batch queued. {traces} trace events to process."),
        }),
    ))
}

/// GET /job-status/{job_id} - Current lifecycle state of a job.
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let job = state.store.get(&job_id)?;
    Ok(Json(job.into()))
}

/// GET /job-result/{job_id} - Span-tree summary or error detail of a
/// finished job.
pub async fn result(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResultResponse>, AppError> {
    let job = state.store.get(&job_id)?;

    match job.result {
        Some(outcome) if job.status.is_terminal() => Ok(Json(JobResultResponse::new(
            job.job_id,
            job.status,
            outcome,
        ))),
        _ => Err(AppError::NotReady {
            job_id: job.job_id,
            status: job.status,
        }),
    }
}

/// GET /jobs - List jobs, newest first.
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            JobStatus::parse(s).ok_or_else(|| AppError::BadRequest(format!("unknown status {s:?}")))
        })
        .transpose()?;

    let query = JobQuery {
        status,
        agent_id: params.agent_id,
        session_id: params.session_id,
        limit: Some(params.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)),
        offset: params.offset,
    };

    let jobs = state.store.list(&query)?;
    Ok(Json(JobListResponse {
        jobs: jobs.into_iter().map(Into::into).collect(),
    }))
}
