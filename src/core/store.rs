//! SQLite job store and durable work queue
//!
//! Every worker and every job gets its own [`Session`], i.e. its own
//! connection; the database runs in WAL mode so they can coexist. The queue
//! is at-least-once: a claimed entry that is not acknowledged within its
//! lease is handed out again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

use crate::core::error::{Error, Result};
use crate::core::geometry::{from_wkb, to_wkb};
use crate::core::job::{Job, JobStatus, NewJob};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    provider TEXT NOT NULL,
    bbox BLOB NOT NULL,
    engine TEXT NOT NULL,
    compression TEXT NOT NULL,
    user_id INTEGER NOT NULL REFERENCES users(id),
    update_flag INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    execution_handle TEXT,
    correlation_id TEXT,
    result_path TEXT,
    last_started TEXT,
    last_finished TEXT,
    last_error TEXT,
    UNIQUE (engine, provider, name)
);

CREATE TABLE IF NOT EXISTS queue (
    correlation_id TEXT PRIMARY KEY,
    job_id INTEGER NOT NULL,
    enqueued_at_ms INTEGER NOT NULL,
    claimed_by TEXT,
    claimed_at_ms INTEGER
);

CREATE INDEX IF NOT EXISTS queue_job ON queue (job_id);
"#;

const JOB_COLUMNS: &str = "id, name, description, provider, bbox, engine, compression, user_id, \
     update_flag, status, execution_handle, correlation_id, result_path, last_started, \
     last_finished, last_error";

/// A queue entry handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub correlation_id: String,
    pub job_id: i64,
    /// The entry was claimed before and its lease expired
    pub redelivered: bool,
}

/// Handle to the database file; hands out sessions
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open or create the database and install the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Store { path };
        let session = store.session()?;
        session.conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        session.conn.execute_batch(SCHEMA)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh connection to the store
    pub fn session(&self) -> Result<Session> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Session { conn })
    }
}

/// One connection's view of users, jobs and the queue
#[derive(Debug)]
pub struct Session {
    conn: Connection,
}

impl Session {
    pub fn create_user(&self, email: &str) -> Result<i64> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::InvalidInput(format!("invalid email address '{email}'")));
        }

        self.conn
            .execute("INSERT INTO users (email) VALUES (?1)", params![email])
            .map_err(|e| conflict_or(e, || format!("user {email} already exists")))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn user_email(&self, user_id: i64) -> Result<String> {
        self.conn
            .query_row(
                "SELECT email FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::UserNotFound(user_id))
    }

    pub fn user_exists(&self, user_id: i64) -> Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![user_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    /// Create the record of a new job in `Queued`
    pub fn insert_job(&self, job: &NewJob) -> Result<Job> {
        self.conn
            .execute(
                "INSERT INTO jobs (name, description, provider, bbox, engine, compression, \
                 user_id, update_flag, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job.name,
                    job.description,
                    job.provider,
                    to_wkb(&job.bbox),
                    job.engine,
                    job.compression.extension(),
                    job.user_id,
                    job.update,
                    JobStatus::Queued.as_str(),
                ],
            )
            .map_err(|e| {
                conflict_or(e, || {
                    format!(
                        "a job for engine {}, provider {} and name {} already exists",
                        job.engine, job.provider, job.name
                    )
                })
            })?;

        self.get_job(self.conn.last_insert_rowid())
    }

    pub fn find_job(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], job_from_row)
            .optional()?)
    }

    pub fn get_job(&self, id: i64) -> Result<Job> {
        self.find_job(id)?.ok_or(Error::JobNotFound(id))
    }

    pub fn job_exists(&self, id: i64) -> Result<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.query_jobs(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id"))
    }

    /// Completed jobs flagged for the update sweep
    pub fn jobs_for_update(&self) -> Result<Vec<Job>> {
        self.query_jobs(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE update_flag = 1 AND status = '{}' ORDER BY id",
            JobStatus::Completed.as_str()
        ))
    }

    fn query_jobs(&self, sql: &str) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(sql)?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Move a job to `status`, enforcing the state machine
    pub fn set_status(&mut self, id: i64, status: JobStatus) -> Result<()> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        let current: JobStatus = current.ok_or(Error::JobNotFound(id))?.parse()?;

        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        tx.execute(
            "UPDATE jobs SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        tx.commit()?;

        debug!("job {id}: {current} -> {status}");
        Ok(())
    }

    pub fn set_execution_handle(&self, id: i64, handle: Option<&str>) -> Result<()> {
        self.update_job(id, "execution_handle", &handle)
    }

    pub fn set_result_path(&self, id: i64, path: Option<&Path>) -> Result<()> {
        let path = path.map(|p| p.display().to_string());
        self.update_job(id, "result_path", &path)
    }

    pub fn set_last_error(&self, id: i64, error: Option<&str>) -> Result<()> {
        self.update_job(id, "last_error", &error)
    }

    pub fn stamp_started(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.update_job(id, "last_started", &at.to_rfc3339())
    }

    pub fn stamp_finished(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.update_job(id, "last_finished", &at.to_rfc3339())
    }

    fn update_job(&self, id: i64, column: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
        let sql = format!("UPDATE jobs SET {column} = ?2 WHERE id = ?1");
        match self.conn.execute(&sql, params![id, value])? {
            0 => Err(Error::JobNotFound(id)),
            _ => Ok(()),
        }
    }

    /// Delete a job record and its unclaimed queue entries
    pub fn delete_job(&mut self, id: i64) -> Result<Job> {
        let job = self.get_job(id)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM queue WHERE job_id = ?1 AND claimed_by IS NULL",
            params![id],
        )?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        tx.commit()?;

        Ok(job)
    }

    /// Put a job on the queue and record the correlation id on it
    pub fn enqueue(&mut self, job_id: i64) -> Result<String> {
        let now = now_ms();
        let correlation_id = format!("{job_id}-{now}");

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO queue (correlation_id, job_id, enqueued_at_ms) VALUES (?1, ?2, ?3)",
            params![correlation_id, job_id, now],
        )?;
        let updated = tx.execute(
            "UPDATE jobs SET correlation_id = ?2 WHERE id = ?1",
            params![job_id, correlation_id],
        )?;
        if updated == 0 {
            return Err(Error::JobNotFound(job_id));
        }
        tx.commit()?;

        Ok(correlation_id)
    }

    /// Claim the oldest entry that is unclaimed or whose lease expired
    pub fn dequeue(&mut self, worker: &str, lease: Duration) -> Result<Option<QueueItem>> {
        let now = now_ms();
        let stale_before = now - lease.as_millis().min(i64::MAX as u128) as i64;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next: Option<(String, i64, Option<String>)> = tx
            .query_row(
                "SELECT correlation_id, job_id, claimed_by FROM queue \
                 WHERE claimed_by IS NULL OR claimed_at_ms <= ?1 \
                 ORDER BY enqueued_at_ms, rowid LIMIT 1",
                params![stale_before],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((correlation_id, job_id, previous)) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE queue SET claimed_by = ?2, claimed_at_ms = ?3 WHERE correlation_id = ?1",
            params![correlation_id, worker, now],
        )?;
        tx.commit()?;

        Ok(Some(QueueItem {
            correlation_id,
            job_id,
            redelivered: previous.is_some(),
        }))
    }

    /// Extend the lease of an entry still claimed by `worker`
    ///
    /// Returns false when the entry is gone or was handed to another worker.
    pub fn renew(&self, correlation_id: &str, worker: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE queue SET claimed_at_ms = ?3 WHERE correlation_id = ?1 AND claimed_by = ?2",
            params![correlation_id, worker, now_ms()],
        )?;
        Ok(changed == 1)
    }

    /// Remove a processed entry
    pub fn ack(&self, correlation_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM queue WHERE correlation_id = ?1",
            params![correlation_id],
        )?;
        Ok(())
    }

    /// Drop the pending entries of a job; claimed entries are left alone
    pub fn cancel(&self, job_id: i64) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM queue WHERE job_id = ?1 AND claimed_by IS NULL",
            params![job_id],
        )?)
    }

    pub fn queue_len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Map a uniqueness violation to `Conflict`, anything else to a store error
fn conflict_or(err: rusqlite::Error, message: impl FnOnce() -> String) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            Error::Conflict(message())
        }
        _ => err.into(),
    }
}

fn conversion_error(index: usize, ty: Type, err: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, ty, Box::new(err))
}

fn parse_timestamp(index: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|text| {
            DateTime::parse_from_rfc3339(&text)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| conversion_error(index, Type::Text, Error::InvalidInput(e.to_string())))
        })
        .transpose()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let bbox: Vec<u8> = row.get(4)?;
    let compression: String = row.get(6)?;
    let status: String = row.get(9)?;
    let result_path: Option<String> = row.get(12)?;

    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        provider: row.get(3)?,
        bbox: from_wkb(&bbox).map_err(|e| conversion_error(4, Type::Blob, e))?,
        engine: row.get(5)?,
        compression: compression
            .parse()
            .map_err(|e| conversion_error(6, Type::Text, e))?,
        user_id: row.get(7)?,
        update: row.get(8)?,
        status: status
            .parse()
            .map_err(|e| conversion_error(9, Type::Text, e))?,
        execution_handle: row.get(10)?,
        correlation_id: row.get(11)?,
        result_path: result_path.map(PathBuf::from),
        last_started: parse_timestamp(13, row.get(13)?)?,
        last_finished: parse_timestamp(14, row.get(14)?)?,
        last_error: row.get(15)?,
    })
}
