//! Table-backed dispatch queue.
//!
//! Entries live in `dispatch_entries`. A claim is a single UPDATE over the
//! best waiting row picked with `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers (in this process or others) never receive the same entry.
//! Claimers poll while the table has nothing eligible.
//!
//! An ack deletes the active row. There is no visibility timeout: a row
//! left active by a process that died mid-job is never handed out again
//! and keeps counting toward `active` until it is deleted by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::{DispatchEntry, JobId, JobType, QueueCounts};
use crate::queue::{AckOutcome, DispatchQueue, record_op};

pub struct PgQueue {
    db: Db,
    poll_interval: Duration,
    /// Since this handle was created, not since the table was.
    completed: AtomicU64,
    failed: AtomicU64,
    closed: watch::Sender<bool>,
}

impl PgQueue {
    pub fn new(db: Db, poll_interval: Duration) -> Self {
        Self {
            db,
            poll_interval,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            closed: watch::Sender::new(false),
        }
    }
}

#[async_trait]
impl DispatchQueue for PgQueue {
    async fn enqueue(&self, entry: DispatchEntry, delay: Duration) -> Result<()> {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO dispatch_entries (job_id, job_type, payload, priority, available_at)
             VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5::double precision / 1000))",
        )
        .bind(entry.job_id.0)
        .bind(entry.job_type.as_str())
        .bind(&entry.payload)
        .bind(entry.priority)
        .bind(delay_ms as f64)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        record_op("enqueue");
        Ok(())
    }

    async fn claim(&self) -> Result<Option<DispatchEntry>> {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return Ok(None);
            }
            if let Some(entry) = self.try_claim().await? {
                return Ok(Some(entry));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = closed.changed() => {}
            }
        }
    }

    async fn try_claim(&self) -> Result<Option<DispatchEntry>> {
        if *self.closed.borrow() {
            return Ok(None);
        }
        let row: Option<(Uuid, String, serde_json::Value, i32)> = sqlx::query_as(
            "UPDATE dispatch_entries SET state = 'active'
             WHERE seq = (
                 SELECT seq FROM dispatch_entries
                 WHERE state = 'waiting' AND available_at <= now()
                 ORDER BY priority DESC, seq ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING job_id, job_type, payload, priority",
        )
        .fetch_optional(self.db.pool())
        .await?;

        let entry = row.map(|(job_id, job_type, payload, priority)| DispatchEntry {
            job_id: JobId(job_id),
            job_type: JobType(job_type),
            payload,
            priority,
        });
        record_op(if entry.is_some() { "claim" } else { "claim_empty" });
        Ok(entry)
    }

    async fn remove(&self, job_id: JobId) -> Result<bool> {
        let rows_affected =
            sqlx::query("DELETE FROM dispatch_entries WHERE job_id = $1 AND state = 'waiting'")
                .bind(job_id.0)
                .execute(self.db.pool())
                .await?
                .rows_affected();
        if rows_affected == 0 {
            debug!(job_id = %job_id, "remove: no waiting entry");
        }
        record_op("remove");
        Ok(rows_affected > 0)
    }

    async fn ack(&self, job_id: JobId, outcome: AckOutcome) -> Result<()> {
        sqlx::query("DELETE FROM dispatch_entries WHERE job_id = $1 AND state = 'active'")
            .bind(job_id.0)
            .execute(self.db.pool())
            .await?;
        match outcome {
            AckOutcome::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            AckOutcome::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            AckOutcome::Retried | AckOutcome::Discarded => {}
        }
        record_op("ack");
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let (waiting, delayed, active): (i64, i64, i64) = sqlx::query_as(
            "SELECT
                COUNT(*) FILTER (WHERE state = 'waiting' AND available_at <= now()),
                COUNT(*) FILTER (WHERE state = 'waiting' AND available_at > now()),
                COUNT(*) FILTER (WHERE state = 'active')
             FROM dispatch_entries",
        )
        .fetch_one(self.db.pool())
        .await?;

        Ok(QueueCounts {
            waiting: waiting as u64,
            delayed: delayed as u64,
            active: active as u64,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        })
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}
