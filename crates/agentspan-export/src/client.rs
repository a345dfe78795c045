//! Batching, retrying exporter.

use agentspan_core::SpanTree;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};

use crate::key::ExportKey;
use crate::otlp::{encode_batches, ResourceInfo};
use crate::retry::BackoffConfig;
use crate::transport::{ExportBatch, Transport, TransportError};

/// Batching and retry settings, captured per job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportPolicy {
    /// Maximum spans per transmission.
    pub batch_size: usize,
    pub backoff: BackoffConfig,
}

impl Default for ExportPolicy {
    fn default() -> Self {
        Self {
            batch_size: 64,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Successful export of a whole tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub export_key: String,
    pub trace_id: String,
    pub batches: usize,
    pub spans: usize,
    /// Transmissions made, retries included.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    #[error("backend unavailable after {attempts} attempts: {last_error}")]
    Transient { attempts: u32, last_error: String },

    #[error("backend rejected the spans after {attempts} attempts: {reason}")]
    Rejected { attempts: u32, reason: String },
}

impl ExportError {
    pub fn attempts(&self) -> u32 {
        match self {
            ExportError::Transient { attempts, .. } | ExportError::Rejected { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Sends span trees to the backend through a [`Transport`].
#[derive(Clone)]
pub struct ExporterClient {
    transport: Arc<dyn Transport>,
    resource: ResourceInfo,
}

impl ExporterClient {
    pub fn new(transport: Arc<dyn Transport>, resource: ResourceInfo) -> Self {
        Self {
            transport,
            resource,
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Exports `tree` under `key`.
    ///
    /// Batches go out in tree order. Each batch is retried on transient
    /// failures up to the policy's attempt bound; a rejection stops the export
    /// immediately. Safe to repeat: the same key and tree always produce the
    /// same ids and idempotency keys.
    pub async fn export(
        &self,
        key: &ExportKey,
        tree: &SpanTree,
        policy: &ExportPolicy,
    ) -> Result<Ack, ExportError> {
        let counter = AtomicU32::new(0);
        self.export_counted(key, tree, policy, &counter).await
    }

    /// Like [`export`](Self::export), also recording every transmission in
    /// `attempts` as it happens, so the count survives the future being
    /// dropped mid-export.
    pub async fn export_counted(
        &self,
        key: &ExportKey,
        tree: &SpanTree,
        policy: &ExportPolicy,
        attempts: &AtomicU32,
    ) -> Result<Ack, ExportError> {
        let export_key = key.as_hex();
        let requests = encode_batches(key, tree, &self.resource, policy.batch_size);
        let total = requests.len();
        let before = attempts.load(Ordering::SeqCst);

        for (index, request) in requests.into_iter().enumerate() {
            let batch = ExportBatch {
                idempotency_key: format!("{export_key}-{index}"),
                index,
                total,
                request,
            };
            self.send_with_retry(&batch, &policy.backoff, attempts, before)
                .await?;
        }

        let ack = Ack {
            export_key,
            trace_id: key.trace_id(),
            batches: total,
            spans: tree.len(),
            attempts: attempts.load(Ordering::SeqCst) - before,
        };
        info!(
            trace_id = %ack.trace_id,
            batches = ack.batches,
            spans = ack.spans,
            attempts = ack.attempts,
            transport = self.transport.name(),
            "Exported span tree"
        );
        Ok(ack)
    }

    async fn send_with_retry(
        &self,
        batch: &ExportBatch,
        backoff: &BackoffConfig,
        attempts: &AtomicU32,
        before: u32,
    ) -> Result<(), ExportError> {
        let max_attempts = backoff.attempts();
        let tries = AtomicU32::new(0);
        let tries = &tries;
        let transport = &self.transport;

        let result = RetryIf::spawn(
            backoff.strategy(),
            move || async move {
                let attempt = tries.fetch_add(1, Ordering::SeqCst);
                if attempt > 0 {
                    debug!(batch = batch.index, attempt, "Retrying export batch");
                }
                attempts.fetch_add(1, Ordering::SeqCst);
                transport.send(batch).await.inspect_err(|e| {
                    warn!(
                        batch = batch.index,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Export batch failed"
                    )
                })
            },
            |e: &TransportError| matches!(e, TransportError::Transient(_)),
        )
        .await;

        let made = attempts.load(Ordering::SeqCst) - before;
        match result {
            Ok(()) => {
                let tries = tries.load(Ordering::SeqCst);
                if tries > 1 {
                    info!(batch = batch.index, tries, "Export batch recovered after retry");
                }
                Ok(())
            }
            Err(TransportError::Rejected(reason)) => {
                warn!(batch = batch.index, reason = %reason, "Export batch rejected");
                Err(ExportError::Rejected {
                    attempts: made,
                    reason,
                })
            }
            Err(TransportError::Transient(last_error)) => Err(ExportError::Transient {
                attempts: made,
                last_error,
            }),
        }
    }
}
