//! Metric instrument factories.
//!
//! Instruments come from the `"jobq"` meter on the globally-registered
//! `MeterProvider`. Without an OTLP endpoint the global provider is a
//! no-op and recording costs nothing.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("jobq")
}

/// Counter: job submissions.
/// Labels: `job_type`, `result` ("ok" | "duplicate" | "error").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.submitted")
        .with_description("Number of job submissions")
        .build()
}

/// Counter: job status transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.state_transitions")
        .with_description("Number of job status transitions")
        .build()
}

/// Counter: automatic retries scheduled after a failed attempt.
/// Labels: `job_type`.
pub fn job_retries() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.retries")
        .with_description("Number of automatic retries scheduled")
        .build()
}

/// Counter: dispatch queue operations.
/// Labels: `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("jobq.queue.operations")
        .with_description("Number of dispatch queue operations")
        .build()
}

/// Histogram: work function duration per attempt.
/// Labels: `job_type`, `outcome`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobq.job.duration_ms")
        .with_description("Work function duration in milliseconds")
        .with_unit("ms")
        .build()
}
