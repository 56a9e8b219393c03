//! Built-in handler that runs a command per job.
//!
//! Each attempt gets a scratch directory holding `job.json` (the claimed
//! row). The command runs with that directory as its working directory.
//! Exit status 0 means success; a `followups.json` array of jobs left behind
//! in the directory is enqueued as fan-out.
//!
//! The directory is removed when the attempt's [`Scratch`] is dropped, which
//! also covers attempts aborted at lease expiry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::engine::{Handler, HandlerResult, JobContext, JobError};
use crate::error::{Error, Result};
use crate::model::{Job, NewJob};

pub const JOB_FILE: &str = "job.json";
pub const FOLLOW_UPS_FILE: &str = "followups.json";

/// Settings for [`ExecHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Parent directory for per-attempt scratch directories.
    pub work_dir: PathBuf,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/workq-jobs"),
        }
    }
}

/// Payload understood by [`ExecHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecPayload {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

pub struct ExecHandler {
    config: ExecConfig,
}

impl ExecHandler {
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Handler for ExecHandler {
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        let payload: ExecPayload = ctx.decode()?;
        let scratch = Scratch::create(&self.config.work_dir, ctx.job()).await?;

        let result = scratch.run(&payload, &ctx).await;
        scratch.cleanup();
        result
    }
}

/// Working directory for one attempt. Deleted on drop.
struct Scratch {
    dir: TempDir,
}

impl Scratch {
    async fn create(base_dir: &Path, job: &Job) -> Result<Self> {
        tokio::fs::create_dir_all(base_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", job.id))
            .tempdir_in(base_dir)?;

        let job_json = serde_json::to_string_pretty(job)?;
        tokio::fs::write(dir.path().join(JOB_FILE), job_json).await?;

        debug!(job_id = %job.id, dir = %dir.path().display(), "scratch dir created");
        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    async fn run(&self, payload: &ExecPayload, ctx: &JobContext) -> HandlerResult {
        // Relative commands resolve against the process CWD, not the
        // scratch dir the child is started in.
        let command = if payload.command.is_relative() {
            std::env::current_dir()?.join(&payload.command)
        } else {
            payload.command.clone()
        };

        debug!(job_id = %ctx.id(), command = %command.display(), "running command");

        let status = Command::new(&command)
            .args(&payload.args)
            .envs(&payload.env)
            .current_dir(self.path())
            .env("WORKQ_JOB_DIR", self.path())
            .env("WORKQ_JOB_ID", ctx.id().to_string())
            .env(
                "WORKQ_ATTEMPTS_REMAINING",
                ctx.attempts_remaining().to_string(),
            )
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| JobError::new(format!("failed to start {}: {e}", command.display())))?;

        if !status.success() {
            return Err(JobError::new(format!(
                "command exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }

        Ok(self.read_follow_ups().await?)
    }

    async fn read_follow_ups(&self) -> Result<Vec<NewJob>> {
        let path = self.path().join(FOLLOW_UPS_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| Error::Other(format!("bad {FOLLOW_UPS_FILE}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the directory now, logging instead of silently dropping errors.
    fn cleanup(self) {
        let dir = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(dir = %dir.display(), "scratch cleanup error: {e}");
        }
    }
}
