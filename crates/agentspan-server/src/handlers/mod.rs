//! HTTP route handlers for the ingestion gateway.

pub mod jobs;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::warn;

use crate::dto::{HealthResponse, ServiceInfo};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/register-traces", post(jobs::register))
        .route("/job-status/{job_id}", get(jobs::status))
        .route("/job-result/{job_id}", get(jobs::result))
        .route("/jobs", get(jobs::list))
        .route("/health", get(health))
        .with_state(state)
}

/// Service description.
pub async fn index() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "agentspan",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: BTreeMap::from([
            ("register_traces", "POST /register-traces"),
            ("job_status", "GET /job-status/{job_id}"),
            ("job_result", "GET /job-result/{job_id}"),
            ("jobs", "GET /jobs"),
            ("health", "GET /health"),
        ]),
    })
}

/// Health check: process liveness plus job store and queue reachability.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let store_ok = state
        .store
        .ping()
        .inspect_err(|e| warn!(error = %e, "Job store health check failed"))
        .is_ok();
    let queue_ok = state
        .queue
        .ping()
        .inspect_err(|e| warn!(error = %e, "Queue health check failed"))
        .is_ok();

    let components = BTreeMap::from([
        ("job_store".to_string(), component(store_ok)),
        ("queue".to_string(), component(queue_ok)),
    ]);
    let (code, status) = overall(store_ok, queue_ok);

    let body = HealthResponse {
        status: status.to_string(),
        components,
        queue_depth: queue_ok.then(|| state.queue.depth().ok()).flatten(),
        jobs: store_ok.then(|| state.store.status_counts().ok()).flatten(),
    };
    (code, Json(body))
}

fn component(ok: bool) -> String {
    if ok { "healthy" } else { "unhealthy" }.to_string()
}

fn overall(store_ok: bool, queue_ok: bool) -> (StatusCode, &'static str) {
    if store_ok && queue_ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    }
}
