//! Job attempt span helpers.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::{JobId, JobStatus, JobType};

use super::metrics;

/// Start a span covering one execution attempt of a job.
///
/// `job.attempt` is declared empty and filled once the claim is recorded.
pub fn start_job_span(job_type: &JobType, job_id: &JobId, worker: usize) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.type" = %job_type,
        "job.id" = %job_id,
        "job.worker" = worker,
        "job.attempt" = tracing::field::Empty,
    )
}

pub fn record_attempt(span: &Span, attempt: u32) {
    span.record("job.attempt", attempt);
}

/// Emit a status transition inside `span` and count it.
pub fn record_state_transition(span: &Span, from: JobStatus, to: JobStatus) {
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
