//! Typed configuration.
//!
//! [`Config`] comes from environment variables and fails fast if required
//! ones are missing; the database URL is wrapped in `SecretString` so it
//! never ends up in logs. [`Settings`] tunes queue and worker behaviour and
//! is read from an optional TOML file.

use crate::engine::{QueueConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::exec::ExecConfig;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT")
                .ok()
                .filter(|s| !s.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Queue, worker and exec handler tuning. Every field has a default.
///
/// ```toml
/// [queue]
/// claim_order = "earliest_deadline"
/// requeue_guard = "versioned"
///
/// [worker]
/// concurrency = 8
/// abort_on_lease_expiry = true
///
/// [exec]
/// work_dir = "/var/lib/workq/jobs"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub exec: ExecConfig,
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("bad settings: {e}")))
    }

    /// Read settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Settings from `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
