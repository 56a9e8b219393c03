//! SQLite job store.
//!
//! Claiming is a single `UPDATE … WHERE id = (SELECT …) RETURNING` statement,
//! which SQLite runs under its database write lock, so two claimers can never
//! observe the same eligible row. `julianday('now')` is stable within a
//! statement and serves as the store clock.
//!
//! That clock only resolves milliseconds, so two statements a few
//! microseconds apart usually read the same instant. A lease counts as
//! lapsed once `deadline <= now`; with a strict comparison a zero time limit
//! would stay leased until the next millisecond tick.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

use super::{ClaimOrder, FinalizeGuard, JOB_COLUMNS, Store, Transition, column_i32, column_u32};
use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob, Status};

/// Store clock as unix seconds with millisecond precision.
const NOW: &str = "((julianday('now') - 2440587.5) * 86400.0)";

/// How long a connection waits on a locked database before reporting BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const FILE_MAX_CONNECTIONS: u32 = 8;

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a database from a URL such as `sqlite:jobs.db` or `sqlite::memory:`.
    ///
    /// In-memory databases live as long as their connection, so they get a
    /// single connection that is never recycled.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = if is_in_memory(url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(FILE_MAX_CONNECTIONS)
                .connect_with(
                    options
                        .journal_mode(SqliteJournalMode::Wal)
                        .synchronous(SqliteSynchronous::Normal),
                )
                .await?
        };

        Ok(Self { pool })
    }

    /// Create a migrated in-memory store (for testing).
    pub async fn in_memory() -> Result<Self> {
        let store = Self::connect("sqlite::memory:").await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[async_trait]
impl Store for SqliteStore {
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn enqueue(&self, job: &NewJob) -> Result<JobId> {
        let payload = serde_json::to_string(&job.payload)?;
        let (id,): (i64,) = sqlx::query_as(&format!(
            "INSERT INTO jobs (status, payload, max_attempts, attempts_remaining, time_limit_seconds, deadline, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3, ?4, {NOW} + ?4, {NOW}, {NOW})
             RETURNING id"
        ))
        .bind(Status::Pending.code())
        .bind(payload)
        .bind(column_i32("max_attempts", job.max_attempts)?)
        .bind(column_i32("time_limit_seconds", job.time_limit_seconds)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(JobId(id))
    }

    async fn claim_next(&self, order: ClaimOrder) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE jobs
             SET status = ?1,
                 deadline = {NOW} + time_limit_seconds,
                 attempts_remaining = attempts_remaining - 1,
                 updated_at = {NOW}
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE attempts_remaining > 0
                   AND (status = ?2 OR (status = ?1 AND deadline <= {NOW}))
                 ORDER BY {order}
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}",
            order = order.order_by(),
        );

        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(Status::InProgress.code())
            .bind(Status::Pending.code())
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRow::try_into_job).transpose()
    }

    async fn finalize(&self, guard: FinalizeGuard, transition: &Transition) -> Result<bool> {
        let (set, reason) = match transition {
            Transition::Complete => (String::new(), None),
            Transition::Requeue => (format!(", deadline = {NOW} + time_limit_seconds"), None),
            Transition::Fail { reason } => (", error = ?5".to_string(), Some(reason.as_str())),
        };
        let sql = format!(
            "UPDATE jobs SET status = ?1, updated_at = {NOW}{set}
             WHERE id = ?2 AND status = ?3 AND (?4 IS NULL OR attempts_remaining = ?4)"
        );

        let mut query = sqlx::query(&sql)
            .bind(transition.target().code())
            .bind(guard.id.0)
            .bind(Status::InProgress.code())
            .bind(guard.bind_token());
        if let Some(reason) = reason {
            query = query.bind(reason);
        }

        let rows_affected = query.execute(&self.pool).await?.rows_affected();
        Ok(rows_affected == 1)
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(Error::NotFound(id))?.try_into_job()
    }

    async fn list_jobs(&self, status: Option<Status>, limit: i64) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id
             LIMIT ?2"
        ))
        .bind(status.map(Status::code))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    status: i64,
    payload: String,
    max_attempts: i64,
    attempts_remaining: i64,
    time_limit_seconds: i64,
    deadline: f64,
    error: Option<String>,
    created_at: f64,
    updated_at: f64,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            status: Status::from_code(self.status)?,
            payload: serde_json::from_str(&self.payload)?,
            max_attempts: column_u32("max_attempts", self.max_attempts)?,
            attempts_remaining: column_u32("attempts_remaining", self.attempts_remaining)?,
            time_limit_seconds: column_u32("time_limit_seconds", self.time_limit_seconds)?,
            deadline: from_unix_seconds("deadline", self.deadline)?,
            error: self.error,
            created_at: from_unix_seconds("created_at", self.created_at)?,
            updated_at: from_unix_seconds("updated_at", self.updated_at)?,
        })
    }
}

fn from_unix_seconds(column: &str, secs: f64) -> Result<DateTime<Utc>> {
    let micros = secs * 1_000_000.0;
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return Err(Error::Other(format!("column {column} out of range: {secs}")));
    }
    DateTime::from_timestamp_micros(micros.round() as i64)
        .ok_or_else(|| Error::Other(format!("column {column} out of range: {secs}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_in_memory_urls() {
        assert!(is_in_memory("sqlite::memory:"));
        assert!(is_in_memory("sqlite:file:jobs?mode=memory&cache=shared"));
        assert!(!is_in_memory("sqlite:jobs.db"));
    }

    #[test]
    fn converts_fractional_unix_seconds() {
        let dt = from_unix_seconds("deadline", 1_700_000_000.25).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn out_of_range_timestamps_are_errors() {
        assert!(from_unix_seconds("deadline", 1e18).is_err());
        assert!(from_unix_seconds("deadline", f64::NAN).is_err());
        assert!(from_unix_seconds("deadline", f64::INFINITY).is_err());
    }
}
