//! SQLite lease queue.
//!
//! Entries stay in `job_queue` until acknowledged. Pulling an entry leases it:
//! the entry becomes invisible until the lease runs out, after which any
//! worker may pull it again. A worker that dies mid-job therefore never loses
//! the job, it only delays it by one lease.

use agentspan_core::TraceBatch;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{to_millis, Database, StoreError};
use crate::jobs::insert_job;

/// Upper bound on how long `pull` sleeps before re-checking for expired leases.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A leased queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub seq: i64,
    pub job_id: String,
    /// How many times this entry has been handed out, this delivery included.
    pub deliveries: u32,
    pub lease_token: String,
    pub leased_until: DateTime<Utc>,
}

/// At-least-once queue of job ids.
pub struct JobQueue {
    db: Arc<Database>,
    notify: Notify,
}

impl JobQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            notify: Notify::new(),
        }
    }

    /// Creates an in-memory queue (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(Database::in_memory()?)))
    }

    /// Enqueues a job id, visible immediately.
    pub fn push(&self, job_id: &str) -> Result<i64, StoreError> {
        let seq = {
            let conn = self.db.lock()?;
            insert_entry(&conn, job_id, Utc::now())?
        };

        debug!(job_id, seq, "Enqueued job");
        self.notify.notify_one();
        Ok(seq)
    }

    /// Stores a new QUEUED job and enqueues it in one transaction, so a job
    /// is never left without a queue entry. Returns the new job id.
    pub fn submit(&self, batch: &TraceBatch) -> Result<String, StoreError> {
        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let seq = {
            let mut conn = self.db.lock()?;
            let tx = conn.transaction()?;
            insert_job(&tx, &job_id, batch, now)?;
            let seq = insert_entry(&tx, &job_id, now)?;
            tx.commit()?;
            seq
        };

        debug!(job_id, seq, agent_id = %batch.agent_id, "Submitted job");
        self.notify.notify_one();
        Ok(job_id)
    }

    /// Leases the oldest visible entry, waiting up to `poll_timeout` for one.
    pub async fn pull(
        &self,
        lease: Duration,
        poll_timeout: Duration,
    ) -> Result<Option<Delivery>, StoreError> {
        let deadline = Instant::now() + poll_timeout;

        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_pull(lease)? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Leases the oldest visible entry without waiting.
    pub fn try_pull(&self, lease: Duration) -> Result<Option<Delivery>, StoreError> {
        let now = Utc::now();
        let leased_until = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let token = Uuid::new_v4().to_string();

        let conn = self.db.lock()?;
        let candidate: Option<(i64, String, u32)> = conn
            .query_row(
                r#"SELECT seq, job_id, deliveries FROM job_queue
                   WHERE visible_at <= ?1 ORDER BY seq LIMIT 1"#,
                params![to_millis(now)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((seq, job_id, deliveries)) = candidate else {
            return Ok(None);
        };

        conn.execute(
            r#"UPDATE job_queue SET visible_at = ?1, deliveries = deliveries + 1, lease_token = ?2
               WHERE seq = ?3"#,
            params![to_millis(leased_until), token, seq],
        )?;

        Ok(Some(Delivery {
            seq,
            job_id,
            deliveries: deliveries + 1,
            lease_token: token,
            leased_until,
        }))
    }

    /// Removes a delivered entry. Returns false when the lease was lost to
    /// another worker or the entry is already gone.
    pub fn ack(&self, delivery: &Delivery) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM job_queue WHERE seq = ?1 AND lease_token = ?2",
            params![delivery.seq, delivery.lease_token],
        )?;
        Ok(removed == 1)
    }

    /// Makes a delivered entry visible again immediately.
    pub fn release(&self, delivery: &Delivery) -> Result<bool, StoreError> {
        let released = {
            let conn = self.db.lock()?;
            conn.execute(
                r#"UPDATE job_queue SET visible_at = ?1, lease_token = NULL
                   WHERE seq = ?2 AND lease_token = ?3"#,
                params![to_millis(Utc::now()), delivery.seq, delivery.lease_token],
            )?
        };
        if released == 1 {
            self.notify.notify_one();
        }
        Ok(released == 1)
    }

    /// Number of entries not yet acknowledged, leased ones included.
    pub fn depth(&self) -> Result<u64, StoreError> {
        let conn = self.db.lock()?;
        let depth = conn.query_row("SELECT COUNT(*) FROM job_queue", [], |row| row.get(0))?;
        Ok(depth)
    }

    /// Re-enqueues every non-terminal job that has no queue entry.
    pub fn requeue_orphans(&self) -> Result<usize, StoreError> {
        let requeued = {
            let conn = self.db.lock()?;
            conn.execute(
                r#"INSERT INTO job_queue (job_id, visible_at, deliveries)
                   SELECT job_id, ?1, 0 FROM jobs
                   WHERE status IN ('QUEUED', 'PROCESSING')
                     AND job_id NOT IN (SELECT job_id FROM job_queue)
                   ORDER BY submitted_at"#,
                params![to_millis(Utc::now())],
            )?
        };

        if requeued > 0 {
            info!(requeued, "Re-enqueued orphaned jobs");
            self.notify.notify_waiters();
        }
        Ok(requeued)
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        self.db.ping()
    }
}

fn insert_entry(
    conn: &Connection,
    job_id: &str,
    visible_at: DateTime<Utc>,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO job_queue (job_id, visible_at, deliveries) VALUES (?1, ?2, 0)",
        params![job_id, to_millis(visible_at)],
    )?;
    Ok(conn.last_insert_rowid())
}
