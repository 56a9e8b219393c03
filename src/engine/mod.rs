//! Job lifecycle engine: queue facade, retry policy, worker loops.

pub mod backoff;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod worker;

pub use backoff::Backoff;
pub use pool::WorkerPool;
pub use queue::{Queue, QueueConfig};
pub use retry::{Disposition, RequeueGuard, RetryPolicy};
pub use worker::{Handler, HandlerResult, JobContext, JobError, Tick, Worker, WorkerConfig};
