//! Shared SQLite connection.

use agentspan_core::JobStatus;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Errors from job store and queue operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Lock error")]
    Lock,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Job {0} not found")]
    NotFound(String),
    #[error("Job {job_id} is {current}, expected {expected}")]
    Conflict {
        job_id: String,
        expected: JobStatus,
        current: JobStatus,
    },
    #[error("Job {job_id} is already {status}")]
    TerminalState { job_id: String, status: JobStatus },
    #[error("Transition {from} -> {to} is not allowed")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("Transition to {status} requires a matching outcome")]
    MissingOutcome { status: JobStatus },
    #[error("Corrupt record for job {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },
}

impl StoreError {
    /// Whether the error means the backing database is unusable, as opposed
    /// to a rejected operation on a single job.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            StoreError::Database(_) | StoreError::Lock | StoreError::Io(_)
        )
    }
}

/// A SQLite database holding the `jobs` and `job_queue` tables.
///
/// The job store and the queue share one connection so that a job and its
/// queue entry live in the same file.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        tracing::info!(path = %path.display(), "Opened job database");
        Ok(db)
    }

    /// Creates an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    /// Round-trips a trivial query.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                submitted_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                input TEXT NOT NULL,
                result TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                agent_id TEXT NOT NULL,
                session_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                deliveries INTEGER NOT NULL DEFAULT 0,
                lease_token TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, updated_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_submitted ON jobs(submitted_at DESC);
            CREATE INDEX IF NOT EXISTS idx_queue_visible ON job_queue(visible_at, seq);
            CREATE INDEX IF NOT EXISTS idx_queue_job ON job_queue(job_id);
            "#,
        )?;

        Ok(())
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(job_id: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        job_id: job_id.to_string(),
        reason: format!("timestamp {ms} out of range"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");

        let db = Database::open(&path).unwrap();
        db.ping().unwrap();
        assert!(path.exists());

        // Reopening keeps the schema.
        drop(db);
        Database::open(&path).unwrap().ping().unwrap();
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(StoreError::Lock.is_infrastructure());
        assert!(!StoreError::NotFound("j".into()).is_infrastructure());
    }
}
