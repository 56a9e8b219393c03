//! # workq
//!
//! Durable job queue over a shared SQL store (Postgres or SQLite).
//!
//! Producers enqueue opaque JSON payloads; any number of workers lease jobs,
//! run them and report back. A lease that outlives its time limit becomes
//! claimable again, and every finalize is guarded by the attempt counter
//! observed at claim time, so a worker that lost its lease cannot overwrite
//! the new holder's result. Delivery is at-least-once.

pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod model;
pub mod store;
pub mod telemetry;

pub use engine::{
    Handler, HandlerResult, JobContext, JobError, Queue, QueueConfig, WorkerConfig, WorkerPool,
};
pub use error::{Error, Result};
pub use model::{Finalization, Job, JobId, Lease, NewJob, Status};
pub use store::{ClaimOrder, Store};
