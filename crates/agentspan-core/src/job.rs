//! Job lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::batch::TraceBatch;
use crate::span::SpanTreeSummary;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Accepted and waiting for a worker.
    Queued,
    /// Held by a worker.
    Processing,
    Success,
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
        }
    }

    /// Parses the stored representation. Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Some(JobStatus::Queued),
            "PROCESSING" => Some(JobStatus::Processing),
            "SUCCESS" => Some(JobStatus::Success),
            "FAILURE" => Some(JobStatus::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Terminal states are final. `PROCESSING -> PROCESSING` is allowed so a
    /// worker can take over a job whose previous lease expired.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Processing | JobStatus::Failure) => true,
            (JobStatus::Processing, _) => next != JobStatus::Queued,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The batch could not be ordered or built into a tree.
    Conversion,
    /// The backend rejected the payload.
    ExportRejected,
    /// The backend stayed unreachable through every retry.
    ExportTransient,
    /// Conversion and export exceeded the processing ceiling.
    Timeout,
    /// The job could not be completed for pipeline-internal reasons.
    Internal,
}

/// Error detail recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Conversion => "conversion",
            FailureKind::ExportRejected => "export_rejected",
            FailureKind::ExportTransient => "export_transient",
            FailureKind::Timeout => "timeout",
            FailureKind::Internal => "internal",
        }
    }
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result of a successful export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    /// Idempotency key the spans were exported under.
    pub export_key: String,
    /// Trace id the backend stores the spans under.
    pub trace_id: String,
    pub batches: usize,
    pub spans_exported: usize,
    pub tree: SpanTreeSummary,
}

/// Terminal result attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Success(ExportSummary),
    Failure(JobFailure),
}

impl JobOutcome {
    /// The terminal status this outcome belongs to.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Success(_) => JobStatus::Success,
            JobOutcome::Failure(_) => JobStatus::Failure,
        }
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            JobOutcome::Failure(f) => Some(f),
            JobOutcome::Success(_) => None,
        }
    }
}

/// A trace batch travelling through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub input: TraceBatch,
    /// Present only once the job is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutcome>,
    pub attempt_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [JobStatus::Success, JobStatus::Failure] {
            for next in [
                JobStatus::Queued,
                JobStatus::Processing,
                JobStatus::Success,
                JobStatus::Failure,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_forward_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Success));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failure));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Success));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Success,
            JobStatus::Failure,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("processing"), Some(JobStatus::Processing));
        assert_eq!(JobStatus::parse("pending"), None);
    }

    #[test]
    fn test_outcome_tagging() {
        let outcome = JobOutcome::Failure(JobFailure::new(FailureKind::Timeout, "too slow"));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "failure");
        assert_eq!(value["kind"], "timeout");
        assert_eq!(outcome.status(), JobStatus::Failure);
    }
}
