//! # Store
//!
//! Durable queue state backed by a single SQLite file.
//!
//! Four tables: `jobs` (the active queue), `dlq` (retired failures),
//! `workers` (liveness), `config` (key/value strings). The store is the only
//! shared resource between workers; every mutation serializes through
//! SQLite's single writer, and the claim operation is a single
//! `UPDATE … RETURNING` statement so competing workers get exactly one
//! winner per job.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::retry;
use crate::timestamp;

/// Config key for the exponential backoff base.
pub const BACKOFF_BASE_KEY: &str = "backoff_base";
/// Config key for the `max_retries` applied when an enqueue omits one.
pub const DEFAULT_MAX_RETRIES_KEY: &str = "default_max_retries";

const DEFAULT_MAX_RETRIES: i64 = 3;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_STORED_ERROR_CHARS: usize = 500;

const SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    next_attempt_at TEXT,
    last_error TEXT
)
    "#,
    r#"
CREATE TABLE IF NOT EXISTS dlq (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    failed_at TEXT NOT NULL,
    last_error TEXT
)
    "#,
    r#"
CREATE TABLE IF NOT EXISTS workers (
    worker_id INTEGER PRIMARY KEY,
    started_at TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL
)
    "#,
    r#"
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
    "#,
];

/// Seeded on init only where absent; `config set` overrides stick.
const CONFIG_DEFAULTS: &[(&str, &str)] = &[
    (BACKOFF_BASE_KEY, "2"),
    (DEFAULT_MAX_RETRIES_KEY, "3"),
];

/// Enumeration of errors for operations with the Store.
///
/// `StorageUnavailable` is transient (lock contention, pool exhaustion) and
/// callers may retry; everything else propagates as fatal.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("a job with id {0} already exists")]
    DuplicateId(String),
    #[error("no dead-letter entry with id {0}")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("{0} is not a valid job state")]
    ParseJobState(String),
    #[error("corrupt row {id}: {message}")]
    CorruptRow { id: String, message: String },
}

impl StoreError {
    fn from_sqlx(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::PoolTimedOut => StoreError::StorageUnavailable(error),
            sqlx::Error::Database(db) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6) mean the bounded
                // transaction wait ran out.
                let busy = matches!(db.code().as_deref(), Some("5") | Some("6"));
                if busy {
                    StoreError::StorageUnavailable(error)
                } else {
                    StoreError::Database(error)
                }
            }
            _ => StoreError::Database(error),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Enumeration of possible states for a job in the active queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting to be picked up by a worker.
    Pending,
    /// Claimed by exactly one worker which is currently running it.
    Processing,
    /// Finished with exit code 0. Terminal.
    Completed,
    /// Failed and scheduled for another attempt once `next_attempt_at` passes.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Allow casting JobState from strings.
impl FromStr for JobState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            invalid => Err(StoreError::ParseJobState(invalid.to_owned())),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// A work item in the active queue.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    /// Opaque string handed to the command runner verbatim.
    pub command: String,
    pub state: JobState,
    /// Completed execution attempts, successful or not.
    pub attempts: i64,
    pub max_retries: i64,
    #[serde(serialize_with = "timestamp::serialize_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "timestamp::serialize_datetime")]
    pub updated_at: DateTime<Utc>,
    /// While set and in the future, the job is ineligible for claim.
    #[serde(serialize_with = "timestamp::serialize_optional_datetime")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    created_at: String,
    updated_at: String,
    next_attempt_at: Option<String>,
    last_error: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state: JobState = row.state.parse()?;
        let created_at = parse_row_timestamp(&row.id, &row.created_at)?;
        let updated_at = parse_row_timestamp(&row.id, &row.updated_at)?;
        let next_attempt_at = row
            .next_attempt_at
            .as_deref()
            .map(|value| parse_row_timestamp(&row.id, value))
            .transpose()?;

        Ok(Job {
            id: row.id,
            command: row.command,
            state,
            attempts: row.attempts,
            max_retries: row.max_retries,
            created_at,
            updated_at,
            next_attempt_at,
            last_error: row.last_error,
        })
    }
}

/// A retired failure. Lives in the dead-letter table until explicitly
/// retried; its id can never collide with an active job.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub command: String,
    /// Every runner invocation counted, i.e. `max_retries + 1`.
    pub attempts: i64,
    pub max_retries: i64,
    #[serde(serialize_with = "timestamp::serialize_datetime")]
    pub failed_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: String,
    command: String,
    attempts: i64,
    max_retries: i64,
    failed_at: String,
    last_error: Option<String>,
}

impl TryFrom<DeadLetterRow> for DeadLetter {
    type Error = StoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        let failed_at = parse_row_timestamp(&row.id, &row.failed_at)?;

        Ok(DeadLetter {
            id: row.id,
            command: row.command,
            attempts: row.attempts,
            max_retries: row.max_retries,
            failed_at,
            last_error: row.last_error,
        })
    }
}

fn parse_row_timestamp(id: &str, value: &str) -> StoreResult<DateTime<Utc>> {
    timestamp::parse_utc(value).map_err(|error| StoreError::CorruptRow {
        id: id.to_owned(),
        message: error.to_string(),
    })
}

/// A job to be inserted into the queue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    /// Falls back to the `default_max_retries` config entry when `None`.
    pub max_retries: Option<i64>,
}

/// What became of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Rescheduled with backoff; the job stays in the active queue.
    Retrying,
    /// Retries exhausted; the job moved to the dead-letter table.
    Dead,
}

/// Row counts per state, for `status`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
    pub workers: i64,
}

/// Cut an error message down to the persisted limit, counting characters.
pub fn truncate_error(error: &str, max_chars: usize) -> String {
    error.chars().take(max_chars).collect()
}

/// A long-lived handle on the queue database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open (creating if missing) the database at `path` and apply the
    /// schema. Safe to call any number of times: schema statements are
    /// `IF NOT EXISTS` and config defaults seed only where absent.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::from_sqlx)?;

        let store = Self { pool, clock };
        store.init().await?;

        Ok(store)
    }

    async fn init(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;
        }

        for (key, value) in CONFIG_DEFAULTS {
            sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;
        }

        Ok(())
    }

    fn stamp(&self) -> String {
        timestamp::format_utc(&self.clock.now())
    }

    /// Insert a new pending job. Fails with `DuplicateId` if the id exists
    /// in either the active queue or the dead-letter table.
    pub async fn enqueue(&self, new_job: NewJob) -> StoreResult<()> {
        let max_retries = match new_job.max_retries {
            Some(max_retries) => max_retries,
            None => self.default_max_retries().await?,
        };
        let now = self.stamp();

        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        let taken: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM jobs WHERE id = ? UNION SELECT 1 FROM dlq WHERE id = ? LIMIT 1",
        )
        .bind(&new_job.id)
        .bind(&new_job.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        if taken.is_some() {
            return Err(StoreError::DuplicateId(new_job.id));
        }

        sqlx::query(
            r#"
INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at)
VALUES (?, ?, 'pending', 0, ?, ?, ?)
            "#,
        )
        .bind(&new_job.id)
        .bind(&new_job.command)
        .bind(max_retries)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|error| match &error {
            sqlx::Error::Database(db) if db.kind() == ErrorKind::UniqueViolation => {
                StoreError::DuplicateId(new_job.id.clone())
            }
            _ => StoreError::from_sqlx(error),
        })?;

        tx.commit().await.map_err(StoreError::from_sqlx)?;

        Ok(())
    }

    async fn default_max_retries(&self) -> StoreResult<i64> {
        Ok(self
            .get_config(DEFAULT_MAX_RETRIES_KEY)
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES))
    }

    /// Atomically claim the oldest eligible job for `worker_id`.
    ///
    /// Eligible means pending, or failed with an elapsed (or absent)
    /// `next_attempt_at`. The select-and-transition happens in one UPDATE
    /// statement, so two workers racing for the same job get one winner;
    /// the loser sees the next job or `None`.
    pub async fn claim_next_job(&self, worker_id: i64) -> StoreResult<Option<Job>> {
        let now = self.stamp();

        let row: Option<JobRow> = sqlx::query_as(
            r#"
UPDATE jobs SET
    state = 'processing',
    updated_at = ?
WHERE id = (
    SELECT id FROM jobs
    WHERE state = 'pending'
       OR (state = 'failed' AND (next_attempt_at IS NULL OR next_attempt_at <= ?))
    ORDER BY created_at, id
    LIMIT 1
)
RETURNING *
            "#,
        )
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job = Job::try_from(row)?;
        tracing::debug!(worker_id, job_id = %job.id, "claimed job");

        Ok(Some(job))
    }

    /// Record a successful attempt. Terminal: the job never transitions
    /// again, which the `state = 'processing'` guard enforces. The attempt
    /// count keeps counting runner invocations, successful or not.
    pub async fn update_job_success(&self, id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE jobs SET state = 'completed', attempts = attempts + 1, updated_at = ? WHERE id = ? AND state = 'processing'",
        )
        .bind(self.stamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Ok(())
    }

    /// Record a failed attempt: bump the attempt count, and either schedule
    /// the next attempt with exponential backoff or, once
    /// `attempts > max_retries`, move the job to the dead-letter table.
    pub async fn update_job_failure(
        &self,
        id: &str,
        current_attempts: i64,
        max_retries: i64,
        backoff_base: i64,
        error: &str,
    ) -> StoreResult<FailureOutcome> {
        let new_attempts = current_attempts + 1;
        let now = self.clock.now();
        let now_text = timestamp::format_utc(&now);
        let error = truncate_error(error, MAX_STORED_ERROR_CHARS);

        if retry::is_exhausted(new_attempts, max_retries) {
            let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

            let command: Option<String> =
                sqlx::query_scalar("SELECT command FROM jobs WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(StoreError::from_sqlx)?;

            // The claimant owns the row, so it is present in practice.
            if let Some(command) = command {
                sqlx::query("DELETE FROM jobs WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::from_sqlx)?;

                // The dead-letter row records every runner invocation:
                // max_retries + 1 in total.
                sqlx::query(
                    r#"
INSERT INTO dlq (id, command, attempts, max_retries, failed_at, last_error)
VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id)
                .bind(&command)
                .bind(new_attempts)
                .bind(max_retries)
                .bind(&now_text)
                .bind(&error)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
            }

            tx.commit().await.map_err(StoreError::from_sqlx)?;

            return Ok(FailureOutcome::Dead);
        }

        let next_attempt_at =
            timestamp::format_utc(&retry::next_attempt_at(new_attempts, backoff_base, now));

        sqlx::query(
            r#"
UPDATE jobs SET
    state = 'failed',
    attempts = ?,
    next_attempt_at = ?,
    last_error = ?,
    updated_at = ?
WHERE id = ?
            "#,
        )
        .bind(new_attempts)
        .bind(&next_attempt_at)
        .bind(&error)
        .bind(&now_text)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Ok(FailureOutcome::Retrying)
    }

    /// All jobs, oldest first, optionally filtered by state.
    pub async fn list_jobs(&self, state: Option<JobState>) -> StoreResult<Vec<Job>> {
        let rows: Vec<JobRow> = match state {
            Some(state) => {
                sqlx::query_as("SELECT * FROM jobs WHERE state = ? ORDER BY created_at, id")
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query_as("SELECT * FROM jobs ORDER BY created_at, id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(StoreError::from_sqlx)?;

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Dead-letter entries, most recently failed first.
    pub async fn dlq_list(&self) -> StoreResult<Vec<DeadLetter>> {
        let rows: Vec<DeadLetterRow> =
            sqlx::query_as("SELECT * FROM dlq ORDER BY failed_at DESC, id")
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;

        rows.into_iter().map(DeadLetter::try_from).collect()
    }

    /// Move a dead-letter entry back into the queue as a fresh pending job,
    /// preserving its id, command and max_retries.
    pub async fn dlq_retry(&self, id: &str) -> StoreResult<()> {
        let now = self.stamp();

        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        let row: Option<DeadLetterRow> = sqlx::query_as("SELECT * FROM dlq WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;

        let Some(row) = row else {
            return Err(StoreError::NotFound(id.to_owned()));
        };

        sqlx::query("DELETE FROM dlq WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;

        sqlx::query(
            r#"
INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at, next_attempt_at, last_error)
VALUES (?, ?, 'pending', 0, ?, ?, ?, NULL, NULL)
            "#,
        )
        .bind(&row.id)
        .bind(&row.command)
        .bind(row.max_retries)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        tx.commit().await.map_err(StoreError::from_sqlx)?;

        Ok(())
    }

    /// Row counts across jobs, dead letters and registered workers.
    pub async fn status(&self) -> StoreResult<StatusCounts> {
        let mut counts = StatusCounts::default();

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;

        for (state, count) in rows {
            match state.parse::<JobState>()? {
                JobState::Pending => counts.pending = count,
                JobState::Processing => counts.processing = count,
                JobState::Completed => counts.completed = count,
                JobState::Failed => counts.failed = count,
            }
        }

        counts.dead = sqlx::query_scalar("SELECT COUNT(*) FROM dlq")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        counts.workers = sqlx::query_scalar("SELECT COUNT(*) FROM workers")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        Ok(counts)
    }

    pub async fn get_config(&self, key: &str) -> StoreResult<Option<String>> {
        sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)
    }

    /// Last-writer-wins upsert.
    pub async fn set_config(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO config (key, value) VALUES (?, ?)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Ok(())
    }

    /// Record a worker's presence; re-registration overwrites.
    pub async fn register_worker(&self, worker_id: i64) -> StoreResult<()> {
        let now = self.stamp();

        sqlx::query(
            r#"
INSERT INTO workers (worker_id, started_at, last_heartbeat) VALUES (?, ?, ?)
ON CONFLICT(worker_id) DO UPDATE SET
    started_at = excluded.started_at,
    last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(worker_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Ok(())
    }

    pub async fn heartbeat_worker(&self, worker_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE workers SET last_heartbeat = ? WHERE worker_id = ?")
            .bind(self.stamp())
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const WORKER_ID: i64 = 4200;

    fn start_instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 14, 22, 0).unwrap()
    }

    async fn open_test_store() -> (Store, Arc<FixedClock>, TempDir) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let clock = Arc::new(FixedClock::new(start_instant()));
        let store = Store::open_with_clock(dir.path().join("queuectl.db"), clock.clone())
            .await
            .expect("failed to open store");

        (store, clock, dir)
    }

    fn new_job(id: &str) -> NewJob {
        NewJob {
            id: id.to_owned(),
            command: "echo hi".to_owned(),
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn test_init_is_idempotent_and_seeds_config() {
        let (store, _clock, dir) = open_test_store().await;

        assert_eq!(
            store.get_config(BACKOFF_BASE_KEY).await.unwrap().as_deref(),
            Some("2")
        );
        assert_eq!(
            store
                .get_config(DEFAULT_MAX_RETRIES_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some("3")
        );

        // A second open over the same file must not clobber overrides.
        store.set_config(BACKOFF_BASE_KEY, "5").await.unwrap();
        let reopened = Store::open(dir.path().join("queuectl.db")).await.unwrap();
        assert_eq!(
            reopened
                .get_config(BACKOFF_BASE_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some("5")
        );
    }

    #[tokio::test]
    async fn test_enqueue_applies_configured_default_max_retries() {
        let (store, _clock, _dir) = open_test_store().await;

        store.enqueue(new_job("defaulted")).await.unwrap();

        store.set_config(DEFAULT_MAX_RETRIES_KEY, "7").await.unwrap();
        store.enqueue(new_job("configured")).await.unwrap();

        store
            .enqueue(NewJob {
                max_retries: Some(0),
                ..new_job("explicit")
            })
            .await
            .unwrap();

        let jobs = store.list_jobs(None).await.unwrap();
        let by_id = |id: &str| jobs.iter().find(|job| job.id == id).unwrap();

        assert_eq!(by_id("defaulted").max_retries, 3);
        assert_eq!(by_id("configured").max_retries, 7);
        assert_eq!(by_id("explicit").max_retries, 0);

        let job = by_id("defaulted");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.created_at, start_instant());
        assert_eq!(job.updated_at, start_instant());
        assert!(job.next_attempt_at.is_none());
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicate_ids() {
        let (store, _clock, _dir) = open_test_store().await;

        store.enqueue(new_job("j1")).await.unwrap();

        let error = store.enqueue(new_job("j1")).await.unwrap_err();
        assert!(matches!(error, StoreError::DuplicateId(id) if id == "j1"));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_ids_held_by_the_dlq() {
        let (store, _clock, _dir) = open_test_store().await;

        store
            .enqueue(NewJob {
                max_retries: Some(0),
                ..new_job("doomed")
            })
            .await
            .unwrap();
        store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        let outcome = store
            .update_job_failure("doomed", 0, 0, 2, "boom")
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Dead);

        let error = store.enqueue(new_job("doomed")).await.unwrap_err();
        assert!(matches!(error, StoreError::DuplicateId(id) if id == "doomed"));
    }

    #[tokio::test]
    async fn test_claim_is_fifo_by_creation_with_id_tiebreak() {
        let (store, clock, _dir) = open_test_store().await;

        store.enqueue(new_job("b")).await.unwrap();
        store.enqueue(new_job("a")).await.unwrap();
        clock.advance(1);
        store.enqueue(new_job("c")).await.unwrap();

        // Same created_at: id breaks the tie.
        let first = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(first.state, JobState::Processing);

        let second = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        assert_eq!(second.id, "b");

        let third = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        assert_eq!(third.id, "c");

        assert!(store.claim_next_job(WORKER_ID).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_job_is_ineligible_until_backoff_elapses() {
        let (store, clock, _dir) = open_test_store().await;

        store.enqueue(new_job("j1")).await.unwrap();
        let job = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();

        let outcome = store
            .update_job_failure(&job.id, job.attempts, job.max_retries, 2, "boom")
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Retrying);

        // delay = 2^1 seconds
        let failed = &store.list_jobs(None).await.unwrap()[0];
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        assert_eq!(
            failed.next_attempt_at,
            Some(start_instant() + chrono::Duration::seconds(2))
        );

        assert!(store.claim_next_job(WORKER_ID).await.unwrap().is_none());

        clock.advance(1);
        assert!(store.claim_next_job(WORKER_ID).await.unwrap().is_none());

        clock.advance(1);
        let reclaimed = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, "j1");
        assert_eq!(reclaimed.attempts, 1);
    }

    #[tokio::test]
    async fn test_stored_errors_are_truncated() {
        let (store, _clock, _dir) = open_test_store().await;

        store.enqueue(new_job("j1")).await.unwrap();
        let job = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();

        let long_error = "x".repeat(800);
        store
            .update_job_failure(&job.id, job.attempts, job.max_retries, 2, &long_error)
            .await
            .unwrap();

        let failed = &store.list_jobs(None).await.unwrap()[0];
        assert_eq!(failed.last_error.as_ref().unwrap().chars().count(), 500);
    }

    #[tokio::test]
    async fn test_exhausted_job_moves_to_dlq() {
        let (store, clock, _dir) = open_test_store().await;

        store
            .enqueue(NewJob {
                max_retries: Some(1),
                ..new_job("j3")
            })
            .await
            .unwrap();

        let job = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        let outcome = store
            .update_job_failure(&job.id, job.attempts, job.max_retries, 1, "first failure")
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Retrying);

        clock.advance(1);
        let job = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        let outcome = store
            .update_job_failure(&job.id, job.attempts, job.max_retries, 1, "second failure")
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Dead);

        assert!(store.list_jobs(None).await.unwrap().is_empty());

        let dead = store.dlq_list().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, "j3");
        // max_retries + 1: both invocations counted
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].max_retries, 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("second failure"));
        assert_eq!(dead[0].failed_at, clock.now());
    }

    #[tokio::test]
    async fn test_dlq_retry_reinserts_a_fresh_pending_job() {
        let (store, clock, _dir) = open_test_store().await;

        store
            .enqueue(NewJob {
                id: "j3".to_owned(),
                command: "exit 1".to_owned(),
                max_retries: Some(0),
            })
            .await
            .unwrap();
        let job = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        store
            .update_job_failure(&job.id, job.attempts, job.max_retries, 2, "boom")
            .await
            .unwrap();

        clock.advance(30);
        store.dlq_retry("j3").await.unwrap();

        assert!(store.dlq_list().await.unwrap().is_empty());

        let jobs = store.list_jobs(None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "j3");
        assert_eq!(jobs[0].command, "exit 1");
        assert_eq!(jobs[0].state, JobState::Pending);
        assert_eq!(jobs[0].attempts, 0);
        assert_eq!(jobs[0].max_retries, 0);
        assert_eq!(jobs[0].created_at, clock.now());
        assert!(jobs[0].next_attempt_at.is_none());
        assert!(jobs[0].last_error.is_none());
    }

    #[tokio::test]
    async fn test_dlq_retry_of_unknown_id_is_not_found() {
        let (store, _clock, _dir) = open_test_store().await;

        let error = store.dlq_retry("ghost").await.unwrap_err();
        assert!(matches!(error, StoreError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_completed_jobs_are_terminal() {
        let (store, _clock, _dir) = open_test_store().await;

        store.enqueue(new_job("j1")).await.unwrap();
        let job = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        store.update_job_success(&job.id).await.unwrap();

        let jobs = store.list_jobs(Some(JobState::Completed)).await.unwrap();
        assert_eq!(jobs.len(), 1);

        // Completed rows are never claimed, and a stray success update is a
        // no-op.
        assert!(store.claim_next_job(WORKER_ID).await.unwrap().is_none());
        store.update_job_success(&job.id).await.unwrap();
        assert_eq!(
            store.list_jobs(Some(JobState::Completed)).await.unwrap()[0].state,
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn test_status_counts_every_table() {
        let (store, _clock, _dir) = open_test_store().await;

        store.enqueue(new_job("completed")).await.unwrap();
        let completed = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        assert_eq!(completed.id, "completed");
        store.update_job_success(&completed.id).await.unwrap();

        store.enqueue(new_job("processing")).await.unwrap();
        let processing = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        assert_eq!(processing.id, "processing");

        store
            .enqueue(NewJob {
                max_retries: Some(0),
                ..new_job("dead")
            })
            .await
            .unwrap();
        let doomed = store.claim_next_job(WORKER_ID).await.unwrap().unwrap();
        assert_eq!(doomed.id, "dead");
        store
            .update_job_failure(&doomed.id, doomed.attempts, doomed.max_retries, 2, "boom")
            .await
            .unwrap();

        store.enqueue(new_job("pending")).await.unwrap();

        store.register_worker(WORKER_ID).await.unwrap();

        let counts = store.status().await.unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                pending: 1,
                processing: 1,
                completed: 1,
                failed: 0,
                dead: 1,
                workers: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_worker_registration_is_an_upsert() {
        let (store, clock, _dir) = open_test_store().await;

        store.register_worker(WORKER_ID).await.unwrap();
        store.register_worker(WORKER_ID).await.unwrap();
        assert_eq!(store.status().await.unwrap().workers, 1);

        clock.advance(5);
        store.heartbeat_worker(WORKER_ID).await.unwrap();

        let last_heartbeat: String =
            sqlx::query_scalar("SELECT last_heartbeat FROM workers WHERE worker_id = ?")
                .bind(WORKER_ID)
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(last_heartbeat, timestamp::format_utc(&clock.now()));
    }

    #[tokio::test]
    async fn test_unknown_config_keys_pass_through() {
        let (store, _clock, _dir) = open_test_store().await;

        assert!(store.get_config("custom_key").await.unwrap().is_none());

        store.set_config("custom_key", "one").await.unwrap();
        store.set_config("custom_key", "two").await.unwrap();
        assert_eq!(
            store.get_config("custom_key").await.unwrap().as_deref(),
            Some("two")
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner_per_job() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("queuectl.db");

        let store = Store::open(&path).await.unwrap();
        for i in 0..20 {
            store
                .enqueue(NewJob {
                    id: format!("job-{i:02}"),
                    command: "echo hi".to_owned(),
                    max_retries: None,
                })
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for slot in 0..4 {
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                let store = Store::open(&path).await.unwrap();
                let mut claimed = Vec::new();
                loop {
                    match store.claim_next_job(WORKER_ID + slot).await {
                        Ok(Some(job)) => claimed.push(job.id),
                        Ok(None) => break,
                        Err(StoreError::StorageUnavailable(_)) => continue,
                        Err(error) => panic!("claim failed: {error}"),
                    }
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }

        all.sort();
        let mut deduped = all.clone();
        deduped.dedup();
        assert_eq!(all.len(), 20, "every job claimed exactly once");
        assert_eq!(all, deduped, "no job claimed twice");

        assert_eq!(store.status().await.unwrap().processing, 20);
    }
}
