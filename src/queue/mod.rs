//! Dispatch Queue: priority broker between submission and workers.
//!
//! Holds lightweight [`DispatchEntry`] projections, never job status. The
//! claim operation is atomic: at most one worker receives a given entry.
//! Higher priority is served first, FIFO within a priority.

mod memory;

pub use memory::MemoryQueue;

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;

use crate::error::Result;
use crate::model::{DispatchEntry, JobId, QueueCounts};
use crate::telemetry::metrics;

/// How a claimed entry left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Completed,
    Failed,
    /// Re-enqueued for another attempt. Counts toward neither total.
    Retried,
    /// Dropped without running (record gone or no longer pending).
    Discarded,
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Add an entry. With a non-zero `delay` the entry is not eligible
    /// for claim until the delay has elapsed.
    async fn enqueue(&self, entry: DispatchEntry, delay: Duration) -> Result<()>;

    /// Claim the next eligible entry, waiting while none is available.
    /// Returns `None` once the queue has been closed.
    async fn claim(&self) -> Result<Option<DispatchEntry>>;

    /// Claim without waiting.
    async fn try_claim(&self) -> Result<Option<DispatchEntry>>;

    /// Drop a not-yet-claimed entry. Returns `false`, not an error, when
    /// no such entry is waiting (for instance, a worker already took it).
    async fn remove(&self, job_id: JobId) -> Result<bool>;

    /// Release a claimed entry from the active set.
    async fn ack(&self, job_id: JobId, outcome: AckOutcome) -> Result<()>;

    async fn counts(&self) -> Result<QueueCounts>;

    /// Stop handing out entries and wake every waiting claimer.
    fn close(&self);
}

/// Count one queue operation. Every backend reports the same names:
/// `enqueue`, `claim`, `claim_empty`, `remove`, `ack`.
pub(crate) fn record_op(operation: &'static str) {
    metrics::queue_operations().add(1, &[KeyValue::new("operation", operation)]);
}
