//! Worker pool: claims dispatch entries, runs work functions, settles records.
//!
//! Each worker is a tokio task running the same loop:
//!
//! 1. take a token from the pool-wide [`RateLimiter`]
//! 2. claim the next entry from the [`DispatchQueue`]
//! 3. move the record `Pending -> Processing` with a guarded write
//! 4. run the registered work function
//! 5. settle the record as `Completed`, `Failed`, or back to `Pending`
//!    with the entry re-enqueued after a backoff delay
//!
//! Every record write the pool makes is guarded on the status it expects,
//! so a record that changed underneath a worker is left alone. A store or
//! queue error partway through never strands a claimed entry: the worker
//! acks it and either re-enqueues it after a backoff delay or, when no
//! attempt is left, fails the record.

pub mod builtin;
mod rate_limit;
mod registry;
mod retry;

pub use rate_limit::RateLimiter;
pub use registry::{WorkError, WorkRegistry, WorkResult};
pub use retry::RetryPolicy;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::model::{DispatchEntry, JobStatus, JobUpdate};
use crate::queue::{AckOutcome, DispatchQueue};
use crate::store::JobStore;
use crate::telemetry::job::{record_attempt, record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// Pause after a failed claim before trying again.
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker tasks.
    pub concurrency: usize,
    /// Claims per second shared by every worker.
    pub rate_per_sec: u32,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_per_sec: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// How one execution attempt ended, decided before any record is written.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(Value),
    /// Failed with attempts to spare.
    Retryable(String),
    /// Failed for good: attempts exhausted or the failure cannot be retried.
    Terminal(String),
}

impl AttemptOutcome {
    pub fn classify(
        result: std::result::Result<Value, WorkError>,
        attempts: u32,
        max_attempts: u32,
    ) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(e) if e.is_retryable() && attempts < max_attempts => {
                AttemptOutcome::Retryable(e.to_string())
            }
            Err(e) => AttemptOutcome::Terminal(e.to_string()),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success(_) => "success",
            AttemptOutcome::Retryable(_) => "retryable",
            AttemptOutcome::Terminal(_) => "terminal",
        }
    }
}

/// State shared by every worker of one pool.
struct Shared {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    registry: Arc<WorkRegistry>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    active: AtomicUsize,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    concurrency: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(ctx: &AppContext, config: WorkerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Arc::clone(&ctx.store),
                queue: Arc::clone(&ctx.queue),
                registry: Arc::clone(&ctx.registry),
                limiter: RateLimiter::per_second(config.rate_per_sec),
                retry: config.retry,
                active: AtomicUsize::new(0),
            }),
            concurrency: config.concurrency.max(1),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks. Calling this on a running pool adds
    /// another full set of workers.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let first = handles.len();
        for id in first..first + self.concurrency {
            let worker = Worker {
                id,
                shared: Arc::clone(&self.shared),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        info!(workers = self.concurrency, "worker pool started");
    }

    /// Jobs currently executing across the pool.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for every worker to finish its current job.
    pub async fn shutdown(&self) {
        self.shared.queue.close();
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("worker task ended abnormally: {e}");
            }
        }
        info!("worker pool stopped");
    }
}

struct Worker {
    id: usize,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker started");
        loop {
            self.shared.limiter.acquire().await;

            let entry = match self.shared.queue.claim().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = self.id, "claim failed: {e}");
                    tokio::time::sleep(CLAIM_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let job_id = entry.job_id;
            self.shared.active.fetch_add(1, Ordering::Relaxed);
            let span = start_job_span(&entry.job_type, &entry.job_id, self.id);
            let mut stage = Stage::Pending { attempts: 0 };
            let result = self
                .process(entry.clone(), &mut stage, &span)
                .instrument(span.clone())
                .await;
            if let Err(e) = result {
                error!(worker = self.id, job_id = %job_id, "processing failed: {e}");
                self.recover(entry, stage, &e).instrument(span).await;
            }
            self.shared.active.fetch_sub(1, Ordering::Relaxed);
        }
        debug!(worker = self.id, "worker stopped");
    }

    async fn process(&self, entry: DispatchEntry, stage: &mut Stage, span: &Span) -> Result<()> {
        let job_id = entry.job_id;
        let store = &self.shared.store;
        let queue = &self.shared.queue;

        let record = match store.get(job_id).await? {
            Some(record) if record.status == JobStatus::Pending => record,
            Some(record) => {
                debug!(job_id = %job_id, status = %record.status, "skipping entry, record not pending");
                *stage = Stage::Settled(AckOutcome::Discarded);
                return queue.ack(job_id, AckOutcome::Discarded).await;
            }
            None => {
                debug!(job_id = %job_id, "skipping entry, record gone");
                *stage = Stage::Settled(AckOutcome::Discarded);
                return queue.ack(job_id, AckOutcome::Discarded).await;
            }
        };

        let attempts = record.attempts + 1;
        let claimed = store
            .update(job_id, Some(JobStatus::Pending), &JobUpdate::claimed(attempts))
            .await?;
        let Some(record) = claimed else {
            debug!(job_id = %job_id, "record changed before claim, skipping");
            *stage = Stage::Settled(AckOutcome::Discarded);
            return queue.ack(job_id, AckOutcome::Discarded).await;
        };
        *stage = Stage::Running {
            attempts,
            max_attempts: record.max_attempts,
        };
        record_attempt(span, attempts);
        record_state_transition(span, JobStatus::Pending, JobStatus::Processing);

        let started = Instant::now();
        let result = self
            .shared
            .registry
            .execute(&entry.job_type, entry.payload.clone())
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = AttemptOutcome::classify(result, attempts, record.max_attempts);
        metrics::job_duration_ms().record(
            elapsed_ms,
            &[
                KeyValue::new("job_type", entry.job_type.as_str().to_owned()),
                KeyValue::new("outcome", outcome.label()),
            ],
        );

        self.settle(entry, attempts, outcome, stage, span).await
    }

    async fn settle(
        &self,
        entry: DispatchEntry,
        attempts: u32,
        outcome: AttemptOutcome,
        stage: &mut Stage,
        span: &Span,
    ) -> Result<()> {
        let job_id = entry.job_id;
        let store = &self.shared.store;
        let queue = &self.shared.queue;

        match outcome {
            AttemptOutcome::Success(value) => {
                let written = store
                    .update(job_id, Some(JobStatus::Processing), &JobUpdate::completed(value))
                    .await?;
                if written.is_some() {
                    record_state_transition(span, JobStatus::Processing, JobStatus::Completed);
                    info!(job_id = %job_id, attempts, "job completed");
                } else {
                    warn!(job_id = %job_id, "record changed while running, result dropped");
                }
                *stage = Stage::Settled(AckOutcome::Completed);
                queue.ack(job_id, AckOutcome::Completed).await
            }
            AttemptOutcome::Terminal(reason) => {
                let written = store
                    .update(job_id, Some(JobStatus::Processing), &JobUpdate::failed(&reason))
                    .await?;
                if written.is_some() {
                    record_state_transition(span, JobStatus::Processing, JobStatus::Failed);
                    warn!(job_id = %job_id, attempts, error = %reason, "job failed");
                } else {
                    warn!(job_id = %job_id, "record changed while running, failure dropped");
                }
                *stage = Stage::Settled(AckOutcome::Failed);
                queue.ack(job_id, AckOutcome::Failed).await
            }
            AttemptOutcome::Retryable(reason) => {
                let written = store
                    .update(job_id, Some(JobStatus::Processing), &JobUpdate::backing_off())
                    .await?;
                if written.is_none() {
                    warn!(job_id = %job_id, "record changed while running, retry dropped");
                    *stage = Stage::Settled(AckOutcome::Discarded);
                    return queue.ack(job_id, AckOutcome::Discarded).await;
                }
                *stage = Stage::Pending { attempts };
                record_state_transition(span, JobStatus::Processing, JobStatus::Pending);

                let delay = self.shared.retry.delay_for(attempts);
                info!(job_id = %job_id, attempts, ?delay, error = %reason, "attempt failed, retrying");
                metrics::job_retries().add(
                    1,
                    &[KeyValue::new("job_type", entry.job_type.as_str().to_owned())],
                );

                queue.ack(job_id, AckOutcome::Retried).await?;
                if let Err(e) = queue.enqueue(entry, delay).await {
                    error!(job_id = %job_id, "requeue failed: {e}");
                    let failed = JobUpdate::failed(format!("{reason} (requeue failed: {e})"));
                    if store
                        .update(job_id, Some(JobStatus::Pending), &failed)
                        .await?
                        .is_some()
                    {
                        record_state_transition(span, JobStatus::Pending, JobStatus::Failed);
                    }
                    *stage = Stage::Settled(AckOutcome::Failed);
                    queue.ack(job_id, AckOutcome::Failed).await?;
                }
                Ok(())
            }
        }
    }

    /// Put a claimed entry back in order after a store or queue error.
    /// The entry always leaves the active set. The job either goes back on
    /// the queue after a backoff delay or, with no attempts left, fails.
    async fn recover(&self, entry: DispatchEntry, stage: Stage, cause: &Error) {
        let job_id = entry.job_id;
        let store = &self.shared.store;
        let queue = &self.shared.queue;

        let attempts = match stage {
            Stage::Settled(outcome) => {
                if let Err(e) = queue.ack(job_id, outcome).await {
                    error!(job_id = %job_id, "ack failed during recovery: {e}");
                }
                return;
            }
            Stage::Running {
                attempts,
                max_attempts,
            } if attempts >= max_attempts => {
                let failed = JobUpdate::failed(format!("final attempt not recorded: {cause}"));
                if let Err(e) = store
                    .update(job_id, Some(JobStatus::Processing), &failed)
                    .await
                {
                    error!(job_id = %job_id, "record left processing: {e}");
                }
                if let Err(e) = queue.ack(job_id, AckOutcome::Failed).await {
                    error!(job_id = %job_id, "ack failed during recovery: {e}");
                }
                return;
            }
            Stage::Running { attempts, .. } => {
                if let Err(e) = store
                    .update(job_id, Some(JobStatus::Processing), &JobUpdate::backing_off())
                    .await
                {
                    error!(job_id = %job_id, "record left processing: {e}");
                }
                attempts
            }
            Stage::Pending { attempts } => attempts,
        };

        let delay = self.shared.retry.delay_for(attempts.max(1));
        if let Err(e) = queue.ack(job_id, AckOutcome::Retried).await {
            warn!(job_id = %job_id, "ack failed during recovery: {e}");
        }
        match queue.enqueue(entry, delay).await {
            Ok(()) => info!(job_id = %job_id, ?delay, "entry re-enqueued after error"),
            Err(e) => error!(job_id = %job_id, "entry dropped, re-enqueue failed: {e}"),
        }
    }
}

/// How far a claimed entry got, so a failed store or queue call can be
/// unwound without losing the job.
#[derive(Debug, Clone, Copy)]
enum Stage {
    /// The record is `Pending` and the entry has to go back on the queue.
    Pending { attempts: u32 },
    /// The record is `Processing` for this attempt.
    Running { attempts: u32, max_attempts: u32 },
    /// The record is written; only the ack is left.
    Settled(AckOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_success() {
        let outcome = AttemptOutcome::classify(Ok(json!({"ok": true})), 1, 3);
        assert_eq!(outcome, AttemptOutcome::Success(json!({"ok": true})));
    }

    #[test]
    fn classify_retries_until_last_attempt() {
        let err = || Err(WorkError::Failed("boom".to_string()));
        assert_eq!(
            AttemptOutcome::classify(err(), 1, 3),
            AttemptOutcome::Retryable("boom".to_string())
        );
        assert_eq!(
            AttemptOutcome::classify(err(), 2, 3),
            AttemptOutcome::Retryable("boom".to_string())
        );
        assert_eq!(
            AttemptOutcome::classify(err(), 3, 3),
            AttemptOutcome::Terminal("boom".to_string())
        );
    }

    #[test]
    fn classify_unregistered_is_terminal() {
        let outcome = AttemptOutcome::classify(
            Err(WorkError::Unregistered("nope".into())),
            1,
            3,
        );
        assert!(matches!(outcome, AttemptOutcome::Terminal(_)));
    }
}
