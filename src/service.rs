//! Job orchestration service: the public façade over store, guard and queue.
//!
//! Every call is scoped to an owner. A record owned by someone else is
//! reported as not found.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::idempotency::IdempotencyGuard;
use crate::model::{
    CANCELLED_BY_USER, DEFAULT_MAX_ATTEMPTS, JobFilter, JobId, JobPage, JobRecord, JobStats,
    JobStatus, JobUpdate, NewJob, OwnerId, PageRequest,
};
use crate::queue::DispatchQueue;
use crate::store::JobStore;
use crate::telemetry::metrics;
use crate::worker::WorkRegistry;

/// Response to a submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub job: JobRecord,
    /// `true` when an earlier record with the same idempotency key was returned.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub message: String,
}

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    registry: Arc<WorkRegistry>,
    guard: IdempotencyGuard,
    default_max_attempts: u32,
}

impl JobService {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            store: Arc::clone(&ctx.store),
            queue: Arc::clone(&ctx.queue),
            registry: Arc::clone(&ctx.registry),
            guard: IdempotencyGuard::new(Arc::clone(&ctx.store)),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Attempt ceiling for submissions that do not set their own.
    pub fn with_default_max_attempts(mut self, n: u32) -> Self {
        self.default_max_attempts = n.max(1);
        self
    }

    /// Validate, deduplicate, persist, and enqueue a new job.
    pub async fn submit(&self, owner: &OwnerId, new: NewJob) -> Result<SubmitOutcome> {
        let job_type = new.job_type().clone();
        let result = self.submit_inner(owner, new).await;

        let label = match &result {
            Ok(outcome) if outcome.duplicate => "duplicate",
            Ok(_) => "ok",
            Err(_) => "error",
        };
        metrics::jobs_submitted().add(
            1,
            &[
                KeyValue::new("job_type", job_type.as_str().to_owned()),
                KeyValue::new("result", label),
            ],
        );
        result
    }

    async fn submit_inner(&self, owner: &OwnerId, new: NewJob) -> Result<SubmitOutcome> {
        new.validate()?;
        if !self.registry.contains(new.job_type()) {
            return Err(Error::Validation(format!(
                "unknown job type: {}",
                new.job_type()
            )));
        }

        if let Some(key) = new.idempotency_key.as_deref()
            && let Some(existing) = self.guard.check(owner, key).await?
        {
            info!(job_id = %existing.job_id, owner = %owner, "duplicate submission");
            return Ok(SubmitOutcome {
                job: existing,
                duplicate: true,
            });
        }

        let record = JobRecord::pending(
            owner.clone(),
            new.default_max_attempts(self.default_max_attempts),
        );
        self.store.create(&record).await?;

        if let Err(e) = self.queue.enqueue(record.dispatch_entry(), Duration::ZERO).await {
            warn!(job_id = %record.job_id, "enqueue failed, removing record: {e}");
            if let Err(cleanup) = self.store.delete(record.job_id).await {
                warn!(job_id = %record.job_id, "could not remove orphaned record: {cleanup}");
            }
            return Err(queue_unavailable(e));
        }

        info!(
            job_id = %record.job_id,
            owner = %owner,
            job_type = %record.job_type,
            priority = record.priority,
            "job submitted"
        );
        Ok(SubmitOutcome {
            job: record,
            duplicate: false,
        })
    }

    pub async fn get(&self, id: JobId, owner: &OwnerId) -> Result<JobRecord> {
        self.store
            .get_for_owner(id, owner)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// One page of the owner's jobs, newest first. `limit` defaults to 20
    /// and is clamped to 100.
    pub async fn list(
        &self,
        owner: &OwnerId,
        filter: &JobFilter,
        limit: Option<u32>,
        offset: Option<u64>,
    ) -> Result<JobPage> {
        let page = PageRequest::new(limit, offset);
        let (jobs, total) = self.store.list(owner, filter, page).await?;
        Ok(JobPage::new(jobs, total, page))
    }

    /// Cancel a job that no worker has claimed yet.
    ///
    /// The final write is guarded on `Pending`. If a worker moved the job
    /// on after the status check, the cancel fails with `InvalidState`
    /// carrying the status it found, and the record is left as the worker
    /// wrote it.
    pub async fn cancel(&self, id: JobId, owner: &OwnerId) -> Result<CancelOutcome> {
        let record = self.get(id, owner).await?;
        if record.status != JobStatus::Pending {
            return Err(Error::InvalidState {
                status: record.status,
                operation: "cancel",
            });
        }

        match self.queue.remove(id).await {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %id, "cancel: no waiting entry, already claimed"),
            Err(e) => warn!(job_id = %id, "cancel: queue removal failed: {e}"),
        }

        let cancelled = self
            .store
            .update(id, Some(JobStatus::Pending), &JobUpdate::failed(CANCELLED_BY_USER))
            .await?;
        if cancelled.is_none() {
            let current = self.get(id, owner).await?;
            debug!(job_id = %id, status = %current.status, "cancel lost the race to a worker");
            return Err(Error::InvalidState {
                status: current.status,
                operation: "cancel",
            });
        }

        info!(job_id = %id, owner = %owner, "job cancelled");
        Ok(CancelOutcome {
            message: "Job cancelled successfully".to_string(),
        })
    }

    /// Reset a failed job and queue it again at its original priority.
    pub async fn retry(&self, id: JobId, owner: &OwnerId) -> Result<JobRecord> {
        let record = self.get(id, owner).await?;
        if record.status != JobStatus::Failed {
            return Err(Error::InvalidState {
                status: record.status,
                operation: "retry",
            });
        }

        let Some(reset) = self
            .store
            .update(id, Some(JobStatus::Failed), &JobUpdate::reset_for_retry())
            .await?
        else {
            // Someone else moved it out of FAILED between our read and write.
            let current = self.get(id, owner).await?;
            return Err(Error::InvalidState {
                status: current.status,
                operation: "retry",
            });
        };

        if let Err(e) = self.queue.enqueue(reset.dispatch_entry(), Duration::ZERO).await {
            warn!(job_id = %id, "re-enqueue failed, restoring record: {e}");
            if let Err(restore) = self
                .store
                .update(id, Some(JobStatus::Pending), &JobUpdate::restore(&record))
                .await
            {
                warn!(job_id = %id, "could not restore record after failed retry: {restore}");
            }
            return Err(queue_unavailable(e));
        }

        info!(job_id = %id, owner = %owner, priority = reset.priority, "job retried");
        Ok(reset)
    }

    /// Owner-scoped status counts plus global queue counts.
    pub async fn stats(&self, owner: &OwnerId) -> Result<JobStats> {
        let user = self.store.count_by_status(owner).await?;
        let queue = self.queue.counts().await?;
        Ok(JobStats { user, queue })
    }
}

fn queue_unavailable(e: Error) -> Error {
    match e {
        Error::QueueUnavailable(_) => e,
        other => Error::QueueUnavailable(other.to_string()),
    }
}
