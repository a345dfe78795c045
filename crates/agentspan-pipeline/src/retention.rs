//! Periodic purge of old terminal jobs.

use agentspan_store::{JobStore, StoreError};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Deletes terminal jobs last updated more than `retention` ago.
pub fn sweep_once(store: &JobStore, retention: Duration) -> Result<usize, StoreError> {
    let cutoff = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| Utc::now().checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let removed = store.purge_terminal_before(cutoff)?;
    if removed > 0 {
        info!(removed, cutoff = %cutoff, "Purged expired jobs");
    }
    Ok(removed)
}

/// Runs [`sweep_once`] every `every` until `shutdown` turns true.
pub fn spawn_retention_sweep(
    store: JobStore,
    retention: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweep_once(&store, retention) {
                        error!(error = %e, "Retention sweep failed");
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentspan_core::{FailureKind, JobFailure, JobOutcome, JobStatus, TraceBatch};

    #[test]
    fn test_sweep_keeps_recent_and_live_jobs() {
        let store = JobStore::in_memory().unwrap();
        let done = store.create(&TraceBatch::new("a", "b", "c")).unwrap();
        let live = store.create(&TraceBatch::new("a", "b", "c")).unwrap();
        let failure = JobOutcome::Failure(JobFailure::new(FailureKind::Internal, "x"));
        store
            .update_status(&done, JobStatus::Failure, Some(&failure))
            .unwrap();

        assert_eq!(sweep_once(&store, Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(sweep_once(&store, Duration::ZERO).unwrap(), 1);
        assert!(store.get(&done).is_err());
        assert_eq!(store.get(&live).unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_sweep_task_stops_on_shutdown() {
        let store = JobStore::in_memory().unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = spawn_retention_sweep(store, Duration::ZERO, Duration::from_millis(10), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
