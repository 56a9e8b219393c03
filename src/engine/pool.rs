//! Worker pool: N independent worker loops plus cooperative shutdown.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::queue::Queue;
use super::worker::{Handler, Worker, WorkerConfig};
use crate::error::{Error, Result};

/// Runs `concurrency` workers against one queue.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Queue,
    handler: Arc<dyn Handler>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(queue: Queue, handler: impl Handler, config: WorkerConfig) -> Self {
        Self::with_shared_handler(queue, Arc::new(handler), config)
    }

    pub fn with_shared_handler(
        queue: Queue,
        handler: Arc<dyn Handler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop claiming new jobs. Jobs already running finish and are
    /// finalized before `run` returns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run every worker until shutdown.
    ///
    /// If a worker hits a fatal store error the whole pool is stopped and
    /// the first such error returned.
    pub async fn run(&self) -> Result<()> {
        let concurrency = self.config.concurrency.max(1);
        let mut tasks = JoinSet::new();

        for id in 0..concurrency {
            let worker = Worker::new(
                id,
                self.queue.clone(),
                Arc::clone(&self.handler),
                self.config.clone(),
                self.shutdown.clone(),
            );
            tasks.spawn(async move { worker.run().await });
        }

        info!(
            concurrency,
            idle_poll_ms = self.config.idle_poll_ms,
            backoff_base_ms = self.config.backoff_base_ms,
            abort_on_lease_expiry = self.config.abort_on_lease_expiry,
            "worker pool started"
        );

        let mut first_error: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => Error::Other(format!("worker task failed: {e}")),
            };
            error!(error = %failure, "worker exited abnormally, stopping pool");
            self.shutdown.cancel();
            first_error.get_or_insert(failure);
        }

        info!("worker pool stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
