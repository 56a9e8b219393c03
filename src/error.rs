//! Error types for workq.
//!
//! Store errors are split at the boundary: transient lock/busy conditions
//! become [`Error::Contention`] (retried by workers with backoff), anything
//! else becomes [`Error::Storage`] and is treated as fatal.

use thiserror::Error;

use crate::model::JobId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("store contention: {0}")]
    Contention(#[source] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for transient store conditions that a caller should retry.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Contention(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if is_contention(&err) {
            Error::Contention(err)
        } else {
            Error::Storage(err)
        }
    }
}

/// Postgres SQLSTATEs and SQLite extended result codes that mean "another
/// transaction is in the way, try again".
const CONTENTION_CODES: &[&str] = &[
    // postgres: serialization_failure, deadlock_detected, lock_not_available
    "40001", "40P01", "55P03",
    // sqlite: BUSY, BUSY_RECOVERY, BUSY_SNAPSHOT, BUSY_TIMEOUT
    "5", "261", "517", "773",
    // sqlite: LOCKED, LOCKED_SHAREDCACHE
    "6", "262",
];

fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| CONTENTION_CODES.contains(&code.as_ref())),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
