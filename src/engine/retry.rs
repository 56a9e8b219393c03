//! Failure handling: requeue while attempts remain, fail terminally after.

use serde::{Deserialize, Serialize};

use crate::model::Lease;
use crate::store::{FinalizeGuard, Transition};

/// How a requeue matches the row it returns to the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueGuard {
    /// Same version guard as completion and terminal failure: a worker whose
    /// lease was taken over cannot push the job back underneath the new
    /// holder.
    #[default]
    Versioned,
    /// Match on id (and in-progress status) only. Compatible with queues that
    /// relied on a stale worker still being able to requeue.
    IdOnly,
}

/// What a failed attempt turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Requeue,
    Fail,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub requeue_guard: RequeueGuard,
}

impl RetryPolicy {
    pub fn new(requeue_guard: RequeueGuard) -> Self {
        Self { requeue_guard }
    }

    /// The claim already consumed an attempt, so a zero token means this
    /// was the last one.
    pub fn disposition(&self, lease: &Lease) -> Disposition {
        if lease.token == 0 {
            Disposition::Fail
        } else {
            Disposition::Requeue
        }
    }

    /// The guarded update that records a failed attempt.
    pub fn plan(&self, lease: &Lease, reason: &str) -> (FinalizeGuard, Transition) {
        match self.disposition(lease) {
            Disposition::Fail => (
                FinalizeGuard::versioned(lease.job_id, lease.token),
                Transition::Fail {
                    reason: reason.to_string(),
                },
            ),
            Disposition::Requeue => {
                let guard = match self.requeue_guard {
                    RequeueGuard::Versioned => FinalizeGuard::versioned(lease.job_id, lease.token),
                    RequeueGuard::IdOnly => FinalizeGuard::id_only(lease.job_id),
                };
                (guard, Transition::Requeue)
            }
        }
    }
}
