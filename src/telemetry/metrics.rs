//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a configured provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: jobs submitted to the store.
/// Labels: `source` ("client" | "fan_out"), `result` ("ok" | "rejected" | "error").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("workq.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("claimed" | "empty" | "contention" | "error").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("workq.jobs.claims")
        .with_description("Number of claim attempts")
        .build()
}

/// Counter: finalize calls.
/// Labels: `outcome` ("completed" | "requeued" | "failed" | "lease_lost").
pub fn jobs_finalized() -> Counter<u64> {
    meter()
        .u64_counter("workq.jobs.finalized")
        .with_description("Number of finalize calls by outcome")
        .build()
}

/// Counter: store contention errors seen by workers.
/// Labels: `operation` ("claim" | "finalize").
pub fn store_contention() -> Counter<u64> {
    meter()
        .u64_counter("workq.store.contention")
        .with_description("Store contention errors")
        .build()
}

/// Histogram: handler run time in milliseconds.
/// Labels: `result` ("ok" | "error").
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.job.duration_ms")
        .with_description("Handler execution time in milliseconds")
        .with_unit("ms")
        .build()
}
