//! Worker loop: claim → run handler → fan out → finalize.
//!
//! Each worker is an independent loop over the shared store. Its only
//! private state is its contention [`Backoff`]. Handlers run as spawned
//! tasks bound to a lease token that fires when the job's time limit
//! elapses, so overrunning work can notice (or be aborted) instead of
//! silently racing a second claimant.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::futures::Notified;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, warn};

use super::backoff::Backoff;
use super::queue::Queue;
use crate::error::Result;
use crate::model::{Finalization, Job, JobId, Lease, NewJob};
use crate::telemetry::job::{record_outcome, record_state_transition, start_job_span};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Handler API
// ---------------------------------------------------------------------------

/// What a handler returns: follow-up jobs on success, a reason on failure.
pub type HandlerResult = std::result::Result<Vec<NewJob>, JobError>;

/// Error returned from job handlers. Its message becomes the failure reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

/// User code run for each claimed job.
///
/// Implemented for any `Fn(JobContext) -> impl Future<Output = HandlerResult>`.
/// A job may run more than once (a lease can expire mid-run and the job be
/// claimed again), so handlers should be idempotent.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        (self)(ctx).await
    }
}

/// Everything a handler gets to see about the job it is running.
pub struct JobContext {
    job: Job,
    lease: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(job: Job, lease: CancellationToken) -> Self {
        Self { job, lease }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    /// The row as returned by the claim.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Deserialize the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, JobError> {
        Ok(T::deserialize(&self.job.payload)?)
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.job.attempts_remaining
    }

    /// True once the lease time limit has elapsed. The job may already be
    /// running elsewhere; side effects after this point can be duplicated.
    pub fn lease_expired(&self) -> bool {
        self.lease.is_cancelled()
    }

    /// Resolves when the lease time limit elapses.
    pub async fn lease_lost(&self) {
        self.lease.cancelled().await
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Worker loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops in a pool.
    pub concurrency: usize,
    /// Longest an idle worker waits before polling again.
    pub idle_poll_ms: u64,
    /// Backoff scale `K`: delays are drawn from `[0, K * e^n)`.
    pub backoff_base_ms: u64,
    /// Upper clamp for a single backoff delay.
    pub backoff_max_ms: u64,
    /// Finalize tries under contention before leaving the lease to expire.
    pub finalize_attempts: u32,
    /// Abort a handler whose lease time limit has elapsed.
    pub abort_on_lease_expiry: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            idle_poll_ms: 250,
            backoff_base_ms: 10,
            backoff_max_ms: 5_000,
            finalize_attempts: 5,
            abort_on_lease_expiry: false,
        }
    }
}

impl WorkerConfig {
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Result of one pass through the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A job was run. `None` if finalization gave up under contention.
    Processed(Option<Finalization>),
    /// Nothing eligible.
    Idle,
    /// The claim hit contention; wait this long before retrying.
    Contended(Duration),
}

/// How a handler run ended, before it is written back.
enum Verdict {
    Complete,
    Fail(String),
}

pub struct Worker {
    id: usize,
    queue: Queue,
    handler: Arc<dyn Handler>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Queue,
        handler: Arc<dyn Handler>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            queue,
            handler,
            config,
            shutdown,
        }
    }

    /// Loop until shutdown is requested or the store fails fatally.
    ///
    /// Shutdown is checked before every claim; a job already running is
    /// finished and finalized first.
    pub async fn run(&self) -> Result<()> {
        debug!(worker = self.id, "worker started");
        let mut backoff = self.config.backoff();

        while !self.shutdown.is_cancelled() {
            // Armed before the claim so an enqueue racing an empty claim
            // still wakes us.
            let wake = self.queue.job_available();
            tokio::pin!(wake);
            wake.as_mut().enable();

            match self.tick(&mut backoff).await? {
                Tick::Processed(_) => {}
                Tick::Idle => self.wait_for_work(wake).await,
                Tick::Contended(delay) => self.pause(delay).await,
            }
        }

        debug!(worker = self.id, "worker stopped");
        Ok(())
    }

    /// One claim attempt, and if it yields a job, one full execution.
    pub async fn tick(&self, backoff: &mut Backoff) -> Result<Tick> {
        match self.queue.claim().await {
            Ok(Some(job)) => {
                backoff.reset();
                let outcome = self.process(job, backoff).await?;
                Ok(Tick::Processed(outcome))
            }
            Ok(None) => {
                backoff.reset();
                Ok(Tick::Idle)
            }
            Err(e) if e.is_contention() => {
                metrics::store_contention().add(1, &[KeyValue::new("operation", "claim")]);
                let delay = backoff.next_delay();
                debug!(
                    worker = self.id,
                    consecutive = backoff.consecutive(),
                    delay_ms = delay.as_millis() as u64,
                    "claim contended, backing off"
                );
                Ok(Tick::Contended(delay))
            }
            Err(e) => {
                error!(worker = self.id, error = %e, "claim failed");
                Err(e)
            }
        }
    }

    async fn wait_for_work(&self, wake: Pin<&mut Notified<'_>>) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = wake => {}
            _ = tokio::time::sleep(self.config.idle_poll_interval()) => {}
        }
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn process(&self, job: Job, backoff: &mut Backoff) -> Result<Option<Finalization>> {
        let span = start_job_span(&job, self.id);
        let lease = job.lease();

        async {
            record_state_transition(&span, "pending", "in_progress");
            let started = Instant::now();
            let result = self.execute(job).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics::job_duration_ms().record(
                elapsed_ms,
                &[KeyValue::new(
                    "result",
                    if result.is_ok() { "ok" } else { "error" },
                )],
            );

            let verdict = match result {
                Ok(follow_ups) => {
                    self.fan_out(lease.job_id, follow_ups).await;
                    Verdict::Complete
                }
                Err(reason) => {
                    warn!(job_id = %lease.job_id, %reason, "job attempt failed");
                    Verdict::Fail(reason)
                }
            };

            let outcome = self.finalize(&lease, &verdict, backoff).await?;
            match outcome {
                Some(Finalization::LeaseLost) => {
                    record_outcome(&span, "lease_lost");
                }
                Some(outcome) => {
                    let to = match outcome {
                        Finalization::Completed => "complete",
                        Finalization::Requeued => "pending",
                        _ => "failed",
                    };
                    record_state_transition(&span, "in_progress", to);
                    record_outcome(&span, &outcome.to_string());
                }
                None => record_outcome(&span, "unfinalized"),
            }
            Ok(outcome)
        }
        .instrument(span.clone())
        .await
    }

    /// Run the handler as its own task under the lease timer.
    async fn execute(&self, job: Job) -> std::result::Result<Vec<NewJob>, String> {
        let time_limit = job.time_limit();
        let lease = CancellationToken::new();
        let ctx = JobContext::new(job, lease.clone());
        let handler = Arc::clone(&self.handler);
        let mut task = tokio::spawn(async move { handler.handle(ctx).await });

        let expiry = tokio::time::sleep(time_limit);
        tokio::pin!(expiry);

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = &mut expiry => {
                lease.cancel();
                warn!(
                    worker = self.id,
                    time_limit_seconds = time_limit.as_secs(),
                    abort = self.config.abort_on_lease_expiry,
                    "lease time limit elapsed while handler still running"
                );
                if self.config.abort_on_lease_expiry {
                    task.abort();
                }
                task.await
            }
        };

        match joined {
            Ok(Ok(follow_ups)) => Ok(follow_ups),
            Ok(Err(e)) => Err(e.message),
            Err(e) if e.is_cancelled() => Err(format!(
                "lease expired after {}s, execution aborted",
                time_limit.as_secs()
            )),
            Err(e) => Err(format!("handler panicked: {e}")),
        }
    }

    /// Enqueue follow-up jobs. Failures are logged and never affect the
    /// parent job.
    async fn fan_out(&self, parent: JobId, follow_ups: Vec<NewJob>) {
        for job in follow_ups {
            match self.queue.enqueue_from(job, "fan_out").await {
                Ok(id) => debug!(parent_id = %parent, job_id = %id, "follow-up enqueued"),
                Err(e) => warn!(parent_id = %parent, error = %e, "follow-up enqueue failed"),
            }
        }
    }

    /// Write the verdict back, retrying contention with backoff.
    ///
    /// Returns `None` if contention outlasted `finalize_attempts`; the lease
    /// then simply expires and the job runs again.
    async fn finalize(
        &self,
        lease: &Lease,
        verdict: &Verdict,
        backoff: &mut Backoff,
    ) -> Result<Option<Finalization>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match verdict {
                Verdict::Complete => self.queue.complete_job(lease).await,
                Verdict::Fail(reason) => self.queue.fail_job(lease, reason).await,
            };

            match result {
                Ok(outcome) => {
                    backoff.reset();
                    return Ok(Some(outcome));
                }
                Err(e) if e.is_contention() => {
                    metrics::store_contention().add(1, &[KeyValue::new("operation", "finalize")]);
                    if attempt >= self.config.finalize_attempts.max(1) {
                        warn!(
                            job_id = %lease.job_id,
                            attempts = attempt,
                            "finalize still contended, leaving lease to expire"
                        );
                        return Ok(None);
                    }
                    let delay = backoff.next_delay();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(job_id = %lease.job_id, error = %e, "finalize failed");
                    return Err(e);
                }
            }
        }
    }
}
