//! SQLite-backed job storage.

use agentspan_core::{Job, JobOutcome, JobStatus, TraceBatch};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::db::{from_millis, to_millis, Database, StoreError};

/// Query parameters for listing jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobQuery {
    /// Filter by status.
    pub status: Option<JobStatus>,
    /// Filter by agent.
    pub agent_id: Option<String>,
    /// Filter by session.
    pub session_id: Option<String>,
    /// Maximum number of jobs to return.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

/// Durable job records.
///
/// Every status change is a single compare-and-set `UPDATE` on the previous
/// status, so concurrent writers can never interleave a partial update and a
/// terminal job can never be reopened.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<Database>,
}

const COLUMNS: &str = "job_id, status, submitted_at, updated_at, input, result, attempt_count";

struct JobRow {
    job_id: String,
    status: String,
    submitted_at: i64,
    updated_at: i64,
    input: String,
    result: Option<String>,
    attempt_count: u32,
}

impl JobRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(JobRow {
            job_id: row.get(0)?,
            status: row.get(1)?,
            submitted_at: row.get(2)?,
            updated_at: row.get(3)?,
            input: row.get(4)?,
            result: row.get(5)?,
            attempt_count: row.get(6)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| StoreError::Corrupt {
            job_id: self.job_id.clone(),
            reason: format!("unknown status {:?}", self.status),
        })?;
        let result = self
            .result
            .as_deref()
            .map(|raw| serde_json::from_str::<JobOutcome>(raw))
            .transpose()?;

        Ok(Job {
            submitted_at: from_millis(&self.job_id, self.submitted_at)?,
            updated_at: from_millis(&self.job_id, self.updated_at)?,
            input: serde_json::from_str(&self.input)?,
            job_id: self.job_id,
            status,
            result,
            attempt_count: self.attempt_count,
        })
    }
}

impl JobStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Creates an in-memory job store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(Database::in_memory()?)))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Stores a new QUEUED job and returns its id.
    pub fn create(&self, batch: &TraceBatch) -> Result<String, StoreError> {
        let job = self.create_with_id(&Uuid::new_v4().to_string(), batch, Utc::now())?;
        Ok(job.job_id)
    }

    /// Stores a new QUEUED job under a caller-chosen id.
    pub fn create_with_id(
        &self,
        job_id: &str,
        batch: &TraceBatch,
        submitted_at: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let conn = self.db.lock()?;
        insert_job(&conn, job_id, batch, submitted_at)?;

        debug!(job_id, agent_id = %batch.agent_id, "Created job");
        get_locked(&conn, job_id)
    }

    /// Retrieves a job by id.
    pub fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        let conn = self.db.lock()?;
        get_locked(&conn, job_id)
    }

    /// Atomically moves a job from `from` to `to`.
    ///
    /// A terminal `to` requires an outcome of the same status; the outcome is
    /// stored in the same statement as the status. `attempts` is added to the
    /// job's attempt count. Fails with [`StoreError::Conflict`] when the job is
    /// no longer in `from`.
    pub fn transition(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        outcome: Option<&JobOutcome>,
        attempts: u32,
    ) -> Result<Job, StoreError> {
        if from.is_terminal() {
            return Err(StoreError::TerminalState {
                job_id: job_id.to_string(),
                status: from,
            });
        }
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        let result = match outcome {
            Some(outcome) if to.is_terminal() && outcome.status() == to => {
                Some(serde_json::to_string(outcome)?)
            }
            None if !to.is_terminal() => None,
            _ => return Err(StoreError::MissingOutcome { status: to }),
        };

        let conn = self.db.lock()?;
        let changed = conn.execute(
            r#"UPDATE jobs SET
               status = ?1, result = ?2, updated_at = ?3,
               attempt_count = attempt_count + ?4
               WHERE job_id = ?5 AND status = ?6"#,
            params![
                to.as_str(),
                result,
                to_millis(Utc::now()),
                attempts,
                job_id,
                from.as_str(),
            ],
        )?;

        if changed == 0 {
            let current = current_status(&conn, job_id)?;
            return Err(if current.is_terminal() {
                StoreError::TerminalState {
                    job_id: job_id.to_string(),
                    status: current,
                }
            } else {
                StoreError::Conflict {
                    job_id: job_id.to_string(),
                    expected: from,
                    current,
                }
            });
        }

        debug!(job_id, from = %from, to = %to, attempts, "Job transitioned");
        get_locked(&conn, job_id)
    }

    /// Moves a job to `to` from whatever state it is currently in.
    pub fn update_status(
        &self,
        job_id: &str,
        to: JobStatus,
        outcome: Option<&JobOutcome>,
    ) -> Result<Job, StoreError> {
        const MAX_RACES: usize = 3;

        let mut last_err = None;
        for _ in 0..MAX_RACES {
            let current = self.get(job_id)?.status;
            match self.transition(job_id, current, to, outcome, 0) {
                Err(e @ StoreError::Conflict { .. }) => last_err = Some(e),
                other => return other,
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::NotFound(job_id.to_string())))
    }

    /// Lists jobs, newest first.
    pub fn list(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError> {
        let conn = self.db.lock()?;

        let mut sql = format!("SELECT {COLUMNS} FROM jobs WHERE 1=1");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(status.as_str().to_string()));
        }

        if let Some(ref agent_id) = query.agent_id {
            sql.push_str(" AND agent_id = ?");
            params_vec.push(Box::new(agent_id.clone()));
        }

        if let Some(ref session_id) = query.session_id {
            sql.push_str(" AND session_id = ?");
            params_vec.push(Box::new(session_id.clone()));
        }

        sql.push_str(" ORDER BY submitted_at DESC, job_id");

        // SQLite requires a LIMIT before OFFSET.
        match (query.limit, query.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), JobRow::read)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }

        Ok(jobs)
    }

    /// Number of jobs per status.
    pub fn status_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    /// Deletes terminal jobs last updated before `cutoff`, with any stale
    /// queue entries. Returns the number of jobs removed.
    pub fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.db.lock()?;
        let cutoff = to_millis(cutoff);

        conn.execute(
            r#"DELETE FROM job_queue WHERE job_id IN
               (SELECT job_id FROM jobs
                WHERE status IN ('SUCCESS', 'FAILURE') AND updated_at < ?1)"#,
            params![cutoff],
        )?;
        let removed = conn.execute(
            "DELETE FROM jobs WHERE status IN ('SUCCESS', 'FAILURE') AND updated_at < ?1",
            params![cutoff],
        )?;

        Ok(removed)
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        self.db.ping()
    }
}

pub(crate) fn insert_job(
    conn: &Connection,
    job_id: &str,
    batch: &TraceBatch,
    submitted_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let input = serde_json::to_string(batch)?;
    conn.execute(
        r#"INSERT INTO jobs
           (job_id, status, submitted_at, updated_at, input, result,
            attempt_count, agent_id, session_id)
           VALUES (?1, ?2, ?3, ?3, ?4, NULL, 0, ?5, ?6)"#,
        params![
            job_id,
            JobStatus::Queued.as_str(),
            to_millis(submitted_at),
            input,
            batch.agent_id,
            batch.session_id,
        ],
    )?;
    Ok(())
}

fn get_locked(conn: &Connection, job_id: &str) -> Result<Job, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM jobs WHERE job_id = ?1"),
            params![job_id],
            JobRow::read,
        )
        .optional()?;

    match row {
        Some(row) => row.into_job(),
        None => Err(StoreError::NotFound(job_id.to_string())),
    }
}

fn current_status(conn: &Connection, job_id: &str) -> Result<JobStatus, StoreError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM jobs WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )
        .optional()?;

    let status = status.ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
    JobStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
        job_id: job_id.to_string(),
        reason: format!("unknown status {status:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentspan_core::{FailureKind, JobFailure};
    use std::thread;

    fn batch() -> TraceBatch {
        TraceBatch::new("A1", "AL1", "s1").with_io("hi", "hello")
    }

    fn failed(message: &str) -> JobOutcome {
        JobOutcome::Failure(JobFailure::new(FailureKind::Conversion, message))
    }

    #[test]
    fn test_job_store_crud() {
        let store = JobStore::in_memory().unwrap();

        let id = store.create(&batch()).unwrap();
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.input, batch());
        assert_eq!(job.attempt_count, 0);
        assert!(job.result.is_none());
        assert_eq!(job.submitted_at, job.updated_at);

        assert!(matches!(store.get("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let store = JobStore::in_memory().unwrap();
        let id = store.create(&batch()).unwrap();

        let job = store
            .transition(&id, JobStatus::Queued, JobStatus::Processing, None, 0)
            .unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        let err = store
            .transition(&id, JobStatus::Queued, JobStatus::Processing, None, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                current: JobStatus::Processing,
                ..
            }
        ));
    }

    #[test]
    fn test_terminal_is_final() {
        let store = JobStore::in_memory().unwrap();
        let id = store.create(&batch()).unwrap();
        store
            .transition(&id, JobStatus::Queued, JobStatus::Processing, None, 0)
            .unwrap();
        let job = store
            .transition(
                &id,
                JobStatus::Processing,
                JobStatus::Failure,
                Some(&failed("bad")),
                1,
            )
            .unwrap();
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.result, Some(failed("bad")));

        let err = store
            .transition(&id, JobStatus::Processing, JobStatus::Processing, None, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::TerminalState {
                status: JobStatus::Failure,
                ..
            }
        ));

        let err = store
            .update_status(&id, JobStatus::Processing, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalState { .. }));
        assert_eq!(store.get(&id).unwrap().result, Some(failed("bad")));
    }

    #[test]
    fn test_terminal_transition_requires_matching_outcome() {
        let store = JobStore::in_memory().unwrap();
        let id = store.create(&batch()).unwrap();
        store
            .transition(&id, JobStatus::Queued, JobStatus::Processing, None, 0)
            .unwrap();

        let err = store
            .transition(&id, JobStatus::Processing, JobStatus::Success, None, 0)
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingOutcome { .. }));

        let err = store
            .transition(
                &id,
                JobStatus::Processing,
                JobStatus::Success,
                Some(&failed("x")),
                0,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingOutcome { .. }));
        assert_eq!(store.get(&id).unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn test_invalid_transition() {
        let store = JobStore::in_memory().unwrap();
        let id = store.create(&batch()).unwrap();

        let err = store
            .transition(&id, JobStatus::Processing, JobStatus::Queued, None, 0)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let store = JobStore::in_memory().unwrap();
        let id = store.create(&batch()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let id = id.clone();
                thread::spawn(move || {
                    store
                        .transition(&id, JobStatus::Queued, JobStatus::Processing, None, 1)
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.get(&id).unwrap().attempt_count, 1);
    }

    #[test]
    fn test_list_and_counts() {
        let store = JobStore::in_memory().unwrap();
        let base = Utc::now();
        for i in 0..3 {
            let mut input = batch();
            input.agent_id = format!("A{i}");
            store
                .create_with_id(&format!("job-{i}"), &input, base + chrono::Duration::seconds(i))
                .unwrap();
        }
        store
            .transition("job-1", JobStatus::Queued, JobStatus::Failure, Some(&failed("x")), 0)
            .unwrap();

        let all = store.list(&JobQuery::default()).unwrap();
        let ids: Vec<&str> = all.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["job-2", "job-1", "job-0"]);

        let queued = store
            .list(&JobQuery {
                status: Some(JobStatus::Queued),
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].job_id, "job-0");

        let by_agent = store
            .list(&JobQuery {
                agent_id: Some("A2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_agent.len(), 1);

        let counts = store.status_counts().unwrap();
        assert_eq!(counts.get("QUEUED"), Some(&2));
        assert_eq!(counts.get("FAILURE"), Some(&1));
    }

    #[test]
    fn test_purge_only_removes_old_terminal_jobs() {
        let store = JobStore::in_memory().unwrap();
        let done = store.create(&batch()).unwrap();
        let waiting = store.create(&batch()).unwrap();
        store
            .transition(&done, JobStatus::Queued, JobStatus::Failure, Some(&failed("x")), 0)
            .unwrap();

        assert_eq!(
            store
                .purge_terminal_before(Utc::now() - chrono::Duration::hours(1))
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .purge_terminal_before(Utc::now() + chrono::Duration::seconds(1))
                .unwrap(),
            1
        );
        assert!(matches!(store.get(&done), Err(StoreError::NotFound(_))));
        assert!(store.get(&waiting).is_ok());
    }
}
