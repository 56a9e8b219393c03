//! Queue facade: enqueue gateway plus claim/complete/fail over a [`Store`].
//!
//! Cheap to clone; every clone shares the store handle and the
//! wake-on-enqueue signal, so idle workers in this process notice new jobs
//! without waiting out their poll interval.

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, warn};

use super::retry::{RequeueGuard, RetryPolicy};
use crate::error::Result;
use crate::model::{Finalization, Job, JobId, Lease, NewJob, Status};
use crate::store::{ClaimOrder, FinalizeGuard, Store, Transition};
use crate::telemetry::metrics;

/// Queue-wide policy, shared by every worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub claim_order: ClaimOrder,
    pub requeue_guard: RequeueGuard,
}

#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn Store>,
    config: QueueConfig,
    retry: RetryPolicy,
    wake: Arc<Notify>,
}

impl Queue {
    pub fn new(store: Arc<dyn Store>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            retry: RetryPolicy::new(config.requeue_guard),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Validate and insert a new pending job.
    pub async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        self.enqueue_from(job, "client").await
    }

    /// Serialize a typed payload and enqueue it.
    pub async fn enqueue_payload<T: Serialize>(
        &self,
        payload: &T,
        max_attempts: u32,
        time_limit_seconds: u32,
    ) -> Result<JobId> {
        let job = NewJob::from_payload(payload)?
            .max_attempts(max_attempts)
            .time_limit_seconds(time_limit_seconds);
        self.enqueue(job).await
    }

    pub(crate) async fn enqueue_from(&self, job: NewJob, source: &'static str) -> Result<JobId> {
        if let Err(e) = job.validate() {
            metrics::jobs_enqueued().add(
                1,
                &[
                    KeyValue::new("source", source),
                    KeyValue::new("result", "rejected"),
                ],
            );
            return Err(e);
        }

        let result = self.store.enqueue(&job).await;
        metrics::jobs_enqueued().add(
            1,
            &[
                KeyValue::new("source", source),
                KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
            ],
        );

        let id = result?;
        debug!(
            job_id = %id,
            source,
            max_attempts = job.max_attempts,
            time_limit_seconds = job.time_limit_seconds,
            "job enqueued"
        );
        self.wake.notify_waiters();
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Lease lifecycle
    // -----------------------------------------------------------------------

    /// Lease the next eligible job, if any.
    pub async fn claim(&self) -> Result<Option<Job>> {
        let result = self.store.claim_next(self.config.claim_order).await;
        let label = match &result {
            Ok(Some(_)) => "claimed",
            Ok(None) => "empty",
            Err(e) if e.is_contention() => "contention",
            Err(_) => "error",
        };
        metrics::claims().add(1, &[KeyValue::new("result", label)]);

        if let Ok(Some(job)) = &result {
            debug!(
                job_id = %job.id,
                attempts_remaining = job.attempts_remaining,
                deadline = %job.deadline,
                "job claimed"
            );
        }
        result
    }

    /// Mark a leased job complete. Loses if the lease was taken over.
    pub async fn complete_job(&self, lease: &Lease) -> Result<Finalization> {
        let guard = FinalizeGuard::versioned(lease.job_id, lease.token);
        let updated = self.store.finalize(guard, &Transition::Complete).await?;
        Ok(self.record(lease, updated, Finalization::Completed))
    }

    /// Record a failed attempt: requeue while attempts remain, otherwise fail
    /// terminally with `reason`.
    pub async fn fail_job(&self, lease: &Lease, reason: &str) -> Result<Finalization> {
        let (guard, transition) = self.retry.plan(lease, reason);
        let outcome = match transition {
            Transition::Requeue => Finalization::Requeued,
            _ => Finalization::Failed,
        };
        let updated = self.store.finalize(guard, &transition).await?;
        if updated && outcome == Finalization::Requeued {
            self.wake.notify_waiters();
        }
        Ok(self.record(lease, updated, outcome))
    }

    fn record(&self, lease: &Lease, updated: bool, outcome: Finalization) -> Finalization {
        let outcome = if updated {
            outcome
        } else {
            Finalization::LeaseLost
        };
        metrics::jobs_finalized().add(1, &[KeyValue::new("outcome", outcome.to_string())]);
        if outcome == Finalization::LeaseLost {
            warn!(
                job_id = %lease.job_id,
                token = lease.token,
                "finalize matched no row, lease lost"
            );
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.store.get_job(id).await
    }

    pub async fn list_jobs(&self, status: Option<Status>, limit: i64) -> Result<Vec<Job>> {
        self.store.list_jobs(status, limit).await
    }

    /// Resolves on the next enqueue or requeue made through this queue.
    ///
    /// Only signals sent after the future is polled or
    /// [`enable`](Notified::enable)d are seen.
    pub(crate) fn job_available(&self) -> Notified<'_> {
        self.wake.notified()
    }
}
