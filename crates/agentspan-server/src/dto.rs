use std::collections::BTreeMap;

use agentspan_core::{ExportSummary, Job, JobFailure, JobOutcome, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// === Jobs ===

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExportSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        let (result, error) = split_outcome(job.result);
        Self {
            job_id: job.job_id,
            status: job.status,
            submitted_at: job.submitted_at,
            updated_at: job.updated_at,
            attempt_count: job.attempt_count,
            result,
            error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResultResponse {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExportSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

fn split_outcome(outcome: Option<JobOutcome>) -> (Option<ExportSummary>, Option<JobFailure>) {
    match outcome {
        Some(JobOutcome::Success(summary)) => (Some(summary), None),
        Some(JobOutcome::Failure(failure)) => (None, Some(failure)),
        None => (None, None),
    }
}

impl JobResultResponse {
    pub fn new(job_id: String, status: JobStatus, outcome: JobOutcome) -> Self {
        let (result, error) = split_outcome(Some(outcome));
        Self {
            job_id,
            status,
            result,
            error,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobStatusResponse>,
}

// === Health ===

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub endpoints: BTreeMap<&'static str, &'static str>,
}
