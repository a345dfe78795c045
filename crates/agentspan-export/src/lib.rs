//! Span tree export to an OTLP/HTTP backend.
//!
//! [`ExporterClient`] encodes a [`SpanTree`](agentspan_core::SpanTree) into
//! OTLP/JSON batches and pushes them through a [`Transport`], retrying
//! transient failures with exponential backoff. Trace and span ids come from
//! an [`ExportKey`], so re-exporting a tree is idempotent at the backend.

mod client;
mod key;
pub mod otlp;
mod retry;
mod transport;

pub use client::{Ack, ExportError, ExportPolicy, ExporterClient};
pub use key::ExportKey;
pub use otlp::ResourceInfo;
pub use retry::BackoffConfig;
pub use transport::{BackendConfig, ExportBatch, OtlpHttpTransport, Transport, TransportError};
