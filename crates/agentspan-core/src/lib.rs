//! Core domain types shared across agentspan.
//!
//! This crate provides the data model the rest of the workspace is built on:
//!
//! - [`TraceBatch`] and [`TraceEvent`] — one agent invocation and its raw trace events
//! - [`Span`] and [`SpanTree`] — the converted, hierarchical span output
//! - [`Job`] and [`JobStatus`] — the lifecycle envelope tracked by the pipeline
//!
//! # Example
//!
//! ```rust
//! use agentspan_core::{TraceBatch, TraceKind};
//!
//! let batch: TraceBatch = serde_json::from_value(serde_json::json!({
//!     "input_text": "hi",
//!     "output_text": "hello",
//!     "agent_id": "AGENT1",
//!     "agent_alias_id": "ALIAS1",
//!     "session_id": "session-1",
//!     "traces": [
//!         {"eventTime": "2024-05-01T10:00:00Z", "trace": {"orchestrationTrace": {}}}
//!     ]
//! }))
//! .unwrap();
//!
//! assert_eq!(batch.traces[0].kind, TraceKind::Orchestration);
//! ```

mod batch;
mod job;
mod span;

pub use batch::{TraceBatch, TraceEvent, TraceKind};
pub use job::{ExportSummary, FailureKind, Job, JobFailure, JobOutcome, JobStatus};
pub use span::{
    AttributeValue, Attributes, Span, SpanId, SpanKind, SpanTree, SpanTreeSummary, TreeError,
};
