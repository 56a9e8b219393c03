//! Job execution span helpers.

use tracing::Span;

use crate::model::Job;

/// Start a span covering one leased attempt of a job.
///
/// `job.outcome` is declared empty and filled in by [`record_outcome`].
pub fn start_job_span(job: &Job, worker: usize) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = job.id.0,
        "job.attempts_remaining" = job.attempts_remaining,
        "job.max_attempts" = job.max_attempts,
        "worker" = worker,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record a status transition as an event inside `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("job.outcome", outcome);
}
