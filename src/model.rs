//! Core data model.
//!
//! A job is an opaque payload plus the bookkeeping the queue needs to lease
//! it out: a status, an attempt budget and a lease deadline. The engine never
//! looks inside the payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job row as observed in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned, monotonically increasing identifier.
    pub id: JobId,

    /// Current lifecycle status.
    pub status: Status,

    /// Caller-owned description of the work.
    pub payload: serde_json::Value,

    /// Attempt budget the job was created with. Never changes.
    pub max_attempts: u32,

    /// Attempts left. Decremented once per granted lease; doubles as the
    /// version token guarding finalization.
    pub attempts_remaining: u32,

    /// How long a lease stays valid once granted.
    pub time_limit_seconds: u32,

    /// Lease expiry while in progress. Computed from the store's clock.
    pub deadline: DateTime<Utc>,

    /// Failure reason, set only when the job is terminally failed.
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The lease held by whoever just claimed this row.
    pub fn lease(&self) -> Lease {
        Lease {
            job_id: self.id,
            token: self.attempts_remaining,
        }
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(u64::from(self.time_limit_seconds))
    }

    /// Number of leases granted so far.
    pub fn attempts_used(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_remaining)
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(JobId)
            .map_err(|_| Error::Other(format!("invalid job id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// Stored as a small integer code; the `job_statuses` lookup table maps the
/// codes to these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for a worker.
    Pending,
    /// Leased to a worker until `deadline`.
    InProgress,
    /// Finished successfully. Terminal.
    Complete,
    /// Out of attempts. Terminal.
    Failed,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Pending,
        Status::InProgress,
        Status::Complete,
        Status::Failed,
    ];

    pub fn code(self) -> i16 {
        match self {
            Status::Pending => 0,
            Status::InProgress => 1,
            Status::Complete => 2,
            Status::Failed => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        Status::ALL
            .into_iter()
            .find(|s| i64::from(s.code()) == code)
            .ok_or_else(|| Error::Other(format!("unknown job status code: {code}")))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Complete | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Complete => "complete",
            Status::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Status::Pending),
            "in_progress" => Ok(Status::InProgress),
            "complete" | "completed" => Ok(Status::Complete),
            "failed" => Ok(Status::Failed),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Lease + finalization
// ---------------------------------------------------------------------------

/// What a worker holds after a successful claim: the job and the
/// `attempts_remaining` value observed at claim time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub token: u32,
}

/// Outcome of a finalize call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    Completed,
    /// Returned to the pool for another attempt.
    Requeued,
    /// Terminally failed.
    Failed,
    /// The guarded update matched no row: the lease expired and someone else
    /// claimed the job, or it was already finalized.
    LeaseLost,
}

impl Finalization {
    pub fn succeeded(self) -> bool {
        !matches!(self, Finalization::LeaseLost)
    }
}

impl std::fmt::Display for Finalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Finalization::Completed => "completed",
            Finalization::Requeued => "requeued",
            Finalization::Failed => "failed",
            Finalization::LeaseLost => "lease_lost",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIME_LIMIT_SECONDS: u32 = 60;

/// Description of a job to enqueue. Also the shape handlers return for
/// fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub payload: serde_json::Value,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_time_limit")]
    pub time_limit_seconds: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_time_limit() -> u32 {
    DEFAULT_TIME_LIMIT_SECONDS
}

impl NewJob {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            time_limit_seconds: DEFAULT_TIME_LIMIT_SECONDS,
        }
    }

    /// Serialize a typed payload.
    pub fn from_payload<T: Serialize>(payload: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(payload)?))
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn time_limit_seconds(mut self, secs: u32) -> Self {
        self.time_limit_seconds = secs;
        self
    }

    /// Reject values the store cannot represent or the lifecycle cannot use.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidJob("max_attempts must be at least 1".into()));
        }
        if i32::try_from(self.max_attempts).is_err() {
            return Err(Error::InvalidJob(format!(
                "max_attempts {} exceeds {}",
                self.max_attempts,
                i32::MAX
            )));
        }
        if i32::try_from(self.time_limit_seconds).is_err() {
            return Err(Error::InvalidJob(format!(
                "time_limit_seconds {} exceeds {}",
                self.time_limit_seconds,
                i32::MAX
            )));
        }
        if self.payload.is_null() {
            return Err(Error::InvalidJob("payload must not be null".into()));
        }
        Ok(())
    }
}
