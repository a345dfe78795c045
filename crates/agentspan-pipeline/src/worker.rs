//! Worker pool: pulls deliveries, converts, exports, records the outcome.

use agentspan_convert::{convert, ConvertOptions};
use agentspan_core::{ExportSummary, FailureKind, Job, JobFailure, JobOutcome, JobStatus};
use agentspan_export::{ExportError, ExportKey, ExporterClient};
use agentspan_store::{Delivery, JobQueue, JobStore, StoreError};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// The job reached a terminal state in this delivery.
    Completed(JobStatus),
    /// The job was already terminal; the delivery was a duplicate.
    Duplicate,
    /// The queue referenced a job the store no longer has.
    Missing,
}

/// Runs jobs from the queue through conversion and export.
#[derive(Clone)]
pub struct WorkerPool {
    store: JobStore,
    queue: Arc<JobQueue>,
    exporter: ExporterClient,
    config: watch::Receiver<PipelineConfig>,
}

impl WorkerPool {
    pub fn new(
        store: JobStore,
        queue: Arc<JobQueue>,
        exporter: ExporterClient,
        config: watch::Receiver<PipelineConfig>,
    ) -> Self {
        Self {
            store,
            queue,
            exporter,
            config,
        }
    }

    /// Starts `workers` worker tasks. Each stops pulling once `shutdown`
    /// turns true, finishing the job it holds first.
    pub fn spawn(&self, workers: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            workers,
            transport = self.exporter.transport_name(),
            "Starting worker pool"
        );
        (0..workers)
            .map(|worker| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run(worker, shutdown).await })
            })
            .collect()
    }

    async fn run(self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let config = self.config.borrow().clone();

            let pulled = tokio::select! {
                _ = shutdown.changed() => break,
                pulled = self.queue.pull(config.lease, config.poll_timeout) => pulled,
            };

            let result = match pulled {
                Ok(Some(delivery)) => self.process_delivery(&delivery).await.map(|_| ()),
                Ok(None) => continue,
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                error!(worker, error = %e, "Worker hit an infrastructure error");
                tokio::time::sleep(config.error_backoff).await;
            }
        }

        debug!(worker, "Worker stopped");
    }

    /// Handles one delivery end to end.
    ///
    /// Conversion and export failures are recorded on the job and the
    /// delivery is acknowledged. Store and queue errors are returned with the
    /// delivery left unacknowledged, so it is redelivered once its lease runs
    /// out. A panic while processing fails the job as `internal` instead of
    /// taking the worker down.
    pub async fn process_delivery(&self, delivery: &Delivery) -> Result<Processed, StoreError> {
        match AssertUnwindSafe(self.handle_delivery(delivery))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => self.fail_panicked(delivery, panic_message(panic.as_ref())),
        }
    }

    fn fail_panicked(&self, delivery: &Delivery, message: String) -> Result<Processed, StoreError> {
        let job_id = delivery.job_id.as_str();
        error!(job_id, panic = %message, "Job processing panicked");

        let job = match self.store.get(job_id) {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                self.queue.ack(delivery)?;
                return Ok(Processed::Missing);
            }
            Err(e) => return Err(e),
        };
        if job.status.is_terminal() {
            self.queue.ack(delivery)?;
            return Ok(Processed::Duplicate);
        }

        let failure = JobFailure::new(
            FailureKind::Internal,
            format!("processing panicked: {message}"),
        );
        self.finish(&job, delivery, JobOutcome::Failure(failure), 1)
    }

    async fn handle_delivery(&self, delivery: &Delivery) -> Result<Processed, StoreError> {
        let job_id = delivery.job_id.as_str();

        let job = match self.store.get(job_id) {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                warn!(job_id, "Dropping delivery for unknown job");
                self.queue.ack(delivery)?;
                return Ok(Processed::Missing);
            }
            Err(e) => return Err(e),
        };

        if job.status.is_terminal() {
            debug!(job_id, status = %job.status, "Skipping duplicate delivery");
            self.queue.ack(delivery)?;
            return Ok(Processed::Duplicate);
        }

        let config = self.config.borrow().clone();

        if delivery.deliveries > config.max_deliveries {
            warn!(
                job_id,
                deliveries = delivery.deliveries,
                max_deliveries = config.max_deliveries,
                "Giving up on repeatedly delivered job"
            );
            let failure = JobFailure::new(
                FailureKind::Internal,
                format!(
                    "job was delivered {} times without completing",
                    delivery.deliveries
                ),
            );
            return self.finish(&job, delivery, JobOutcome::Failure(failure), 0);
        }

        let Some(job) = self.claim(&job)? else {
            self.queue.ack(delivery)?;
            return Ok(Processed::Duplicate);
        };
        info!(job_id, delivery = delivery.deliveries, "Processing job");

        let attempts = AtomicU32::new(0);
        let outcome = match tokio::time::timeout(
            config.job_timeout,
            self.convert_and_export(&job, &config, &attempts),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(job_id, timeout = ?config.job_timeout, "Job timed out");
                JobOutcome::Failure(JobFailure::new(
                    FailureKind::Timeout,
                    format!(
                        "conversion and export exceeded {}s",
                        config.job_timeout.as_secs_f64()
                    ),
                ))
            }
        };

        let attempts = attempts.load(Ordering::SeqCst).max(1);
        self.finish(&job, delivery, outcome, attempts)
    }

    /// Moves the job to PROCESSING. A job already in PROCESSING is a
    /// redelivery after a lost lease and is taken over. Returns `None` when
    /// the job turned terminal in the meantime.
    fn claim(&self, job: &Job) -> Result<Option<Job>, StoreError> {
        let id = job.job_id.as_str();
        let claimed = match self
            .store
            .transition(id, job.status, JobStatus::Processing, None, 0)
        {
            Err(StoreError::Conflict {
                current: JobStatus::Processing,
                ..
            }) => self
                .store
                .transition(id, JobStatus::Processing, JobStatus::Processing, None, 0),
            other => other,
        };

        match claimed {
            Ok(job) => Ok(Some(job)),
            Err(StoreError::TerminalState { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn convert_and_export(
        &self,
        job: &Job,
        config: &PipelineConfig,
        attempts: &AtomicU32,
    ) -> JobOutcome {
        let options =
            ConvertOptions::new(job.submitted_at).with_guardrail_parent(config.guardrail_parent);

        let tree = match convert(&job.input, &options) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Conversion failed");
                return JobOutcome::Failure(JobFailure::new(FailureKind::Conversion, e.to_string()));
            }
        };

        let key = ExportKey::derive(&job.job_id, &tree);
        match self
            .exporter
            .export_counted(&key, &tree, &config.export, attempts)
            .await
        {
            Ok(ack) => JobOutcome::Success(ExportSummary {
                export_key: ack.export_key,
                trace_id: ack.trace_id,
                batches: ack.batches,
                spans_exported: ack.spans,
                tree: tree.summary(),
            }),
            Err(e) => {
                let kind = match e {
                    ExportError::Rejected { .. } => FailureKind::ExportRejected,
                    ExportError::Transient { .. } => FailureKind::ExportTransient,
                };
                JobOutcome::Failure(JobFailure::new(kind, e.to_string()))
            }
        }
    }

    /// Records the terminal outcome and acknowledges the delivery.
    fn finish(
        &self,
        job: &Job,
        delivery: &Delivery,
        outcome: JobOutcome,
        attempts: u32,
    ) -> Result<Processed, StoreError> {
        let job_id = job.job_id.as_str();
        let status = outcome.status();
        let from = match job.status {
            JobStatus::Queued => JobStatus::Queued,
            _ => JobStatus::Processing,
        };

        let processed = match self
            .store
            .transition(job_id, from, status, Some(&outcome), attempts)
        {
            Ok(done) => {
                match outcome.failure() {
                    Some(failure) => warn!(
                        job_id,
                        kind = failure.kind.as_str(),
                        attempt_count = done.attempt_count,
                        "Job failed"
                    ),
                    None => info!(job_id, attempt_count = done.attempt_count, "Job succeeded"),
                }
                Processed::Completed(status)
            }
            Err(StoreError::TerminalState { status: current, .. }) => {
                debug!(job_id, status = %current, "Job finished by another delivery");
                Processed::Duplicate
            }
            Err(e) => return Err(e),
        };

        if !self.queue.ack(delivery)? {
            debug!(job_id, "Lease lost before ack; entry will be redelivered");
        }
        Ok(processed)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
