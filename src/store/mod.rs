//! Store boundary: the durable job table and its atomic primitives.
//!
//! Every lifecycle change is one store statement. Claiming is a single
//! select-and-update; completion, requeue and terminal failure all go through
//! one version-guarded conditional update ([`Store::finalize`]). Deadline
//! arithmetic always uses the store's clock, never the caller's.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob, Status};

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

/// Columns selected for every job read, in `Job` field order.
pub(crate) const JOB_COLUMNS: &str = "id, status, payload, max_attempts, attempts_remaining, \
     time_limit_seconds, deadline, error, created_at, updated_at";

/// Durable job table.
///
/// Implementations must be safe to share between any number of concurrent
/// workers; all coordination happens through the store's own transactional
/// guarantees.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create or upgrade the schema.
    async fn migrate(&self) -> Result<()>;

    async fn health_check(&self) -> Result<()>;

    /// Insert a new pending job with a full attempt budget.
    async fn enqueue(&self, job: &NewJob) -> Result<JobId>;

    /// Atomically lease one eligible job.
    ///
    /// A job is eligible when it has attempts left and is either pending or
    /// in progress with a lapsed deadline. The chosen row moves to
    /// in-progress, its deadline becomes `now + time_limit` and
    /// `attempts_remaining` drops by one. Returns the row after the update.
    async fn claim_next(&self, order: ClaimOrder) -> Result<Option<Job>>;

    /// Apply `transition` if the row still matches `guard` and is in
    /// progress. Returns whether a row was updated.
    async fn finalize(&self, guard: FinalizeGuard, transition: &Transition) -> Result<bool>;

    async fn get_job(&self, id: JobId) -> Result<Job>;

    /// List jobs by ascending id, optionally filtered by status.
    async fn list_jobs(&self, status: Option<Status>, limit: i64) -> Result<Vec<Job>>;
}

/// Open a store from a connection URL, choosing the adapter by scheme.
pub async fn connect(url: &str) -> Result<Arc<dyn Store>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(PgStore::connect(url).await?))
    } else if url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::connect(url).await?))
    } else {
        let scheme = url.split(':').next().unwrap_or_default();
        Err(Error::Config(format!("unsupported database scheme: {scheme}")))
    }
}

// ---------------------------------------------------------------------------
// Claim ordering
// ---------------------------------------------------------------------------

/// Which eligible job a claim picks first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOrder {
    /// Latest deadline first. Matches the historical behaviour.
    #[default]
    LatestDeadline,
    /// Earliest deadline first: oldest work tends to go out first.
    EarliestDeadline,
}

impl ClaimOrder {
    pub(crate) fn order_by(self) -> &'static str {
        match self {
            ClaimOrder::LatestDeadline => "deadline DESC, id ASC",
            ClaimOrder::EarliestDeadline => "deadline ASC, id ASC",
        }
    }
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

/// Row match for a finalize update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeGuard {
    pub id: JobId,
    /// Expected `attempts_remaining`. `None` matches on id alone.
    pub token: Option<u32>,
}

impl FinalizeGuard {
    pub fn versioned(id: JobId, token: u32) -> Self {
        Self {
            id,
            token: Some(token),
        }
    }

    pub fn id_only(id: JobId) -> Self {
        Self { id, token: None }
    }

    /// Token as the store's signed column type.
    pub(crate) fn bind_token(&self) -> Option<i32> {
        self.token.map(|t| i32::try_from(t).unwrap_or(i32::MAX))
    }
}

/// Where a finalize update moves an in-progress job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Complete,
    /// Back to pending with a refreshed deadline.
    Requeue,
    /// Terminal failure recording `reason`.
    Fail { reason: String },
}

impl Transition {
    pub fn target(&self) -> Status {
        match self {
            Transition::Complete => Status::Complete,
            Transition::Requeue => Status::Pending,
            Transition::Fail { .. } => Status::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

pub(crate) fn column_u32(column: &str, value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::Other(format!("column {column} out of range: {value}")))
}

pub(crate) fn column_i32(column: &str, value: u32) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::InvalidJob(format!("{column} out of range: {value}")))
}
