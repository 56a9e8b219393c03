//! Postgres job store.
//!
//! Claims lock the chosen row with `FOR UPDATE SKIP LOCKED`, so concurrent
//! claimers never wait on each other or receive the same row. Time comes from
//! the server's `now()`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{ClaimOrder, FinalizeGuard, JOB_COLUMNS, Store, Transition, column_i32, column_u32};
use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob, Status};

/// Postgres-backed store. Owns the connection pool shared by all workers.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn enqueue(&self, job: &NewJob) -> Result<JobId> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO jobs (status, payload, max_attempts, attempts_remaining, time_limit_seconds, deadline)
             VALUES ($1, $2, $3, $3, $4, now() + $4 * interval '1 second')
             RETURNING id",
        )
        .bind(Status::Pending.code())
        .bind(&job.payload)
        .bind(column_i32("max_attempts", job.max_attempts)?)
        .bind(column_i32("time_limit_seconds", job.time_limit_seconds)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(JobId(id))
    }

    async fn claim_next(&self, order: ClaimOrder) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE jobs
             SET status = $1,
                 deadline = now() + time_limit_seconds * interval '1 second',
                 attempts_remaining = attempts_remaining - 1,
                 updated_at = now()
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE attempts_remaining > 0
                   AND (status = $2 OR (status = $1 AND deadline < now()))
                 ORDER BY {order}
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
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
            Transition::Complete => ("", None),
            Transition::Requeue => (
                ", deadline = now() + time_limit_seconds * interval '1 second'",
                None,
            ),
            Transition::Fail { reason } => (", error = $5", Some(reason.as_str())),
        };
        let sql = format!(
            "UPDATE jobs SET status = $1, updated_at = now(){set}
             WHERE id = $2 AND status = $3 AND ($4::INTEGER IS NULL OR attempts_remaining = $4)"
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
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(Error::NotFound(id))?.try_into_job()
    }

    async fn list_jobs(&self, status: Option<Status>, limit: i64) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE ($1::SMALLINT IS NULL OR status = $1)
             ORDER BY id
             LIMIT $2"
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
    status: i16,
    payload: serde_json::Value,
    max_attempts: i32,
    attempts_remaining: i32,
    time_limit_seconds: i32,
    deadline: DateTime<Utc>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            status: Status::from_code(self.status.into())?,
            payload: self.payload,
            max_attempts: column_u32("max_attempts", self.max_attempts.into())?,
            attempts_remaining: column_u32("attempts_remaining", self.attempts_remaining.into())?,
            time_limit_seconds: column_u32("time_limit_seconds", self.time_limit_seconds.into())?,
            deadline: self.deadline,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
