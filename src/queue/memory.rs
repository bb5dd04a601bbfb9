//! In-process priority broker.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::trace;

use super::{AckOutcome, DispatchQueue, record_op};
use crate::error::Result;
use crate::model::{DispatchEntry, JobId, QueueCounts};

/// Heap slot. Max-heap order: highest priority, then lowest sequence.
struct Ready {
    seq: u64,
    entry: DispatchEntry,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry
            .priority
            .cmp(&other.entry.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Delayed {
    due: Instant,
    entry: DispatchEntry,
}

#[derive(Default)]
struct Inner {
    ready: BinaryHeap<Ready>,
    delayed: Vec<Delayed>,
    active: HashSet<JobId>,
    next_seq: u64,
    completed: u64,
    failed: u64,
}

impl Inner {
    fn push_ready(&mut self, entry: DispatchEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(Ready { seq, entry });
    }

    /// Move every delayed entry whose backoff has elapsed into the ready set,
    /// oldest due first so FIFO holds among them.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.iter().all(|d| d.due > now) {
            return;
        }
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|d| d.due <= now);
        self.delayed = pending;
        due.sort_by_key(|d| d.due);
        for d in due {
            self.push_ready(d.entry);
        }
    }

    fn pop(&mut self, now: Instant) -> Option<DispatchEntry> {
        self.promote_due(now);
        let Ready { entry, .. } = self.ready.pop()?;
        self.active.insert(entry.job_id);
        Some(entry)
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|d| d.due).min()
    }
}

/// Priority queue living in process memory. Counters start at zero with
/// the queue.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    closed: watch::Sender<bool>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            closed: watch::Sender::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl DispatchQueue for MemoryQueue {
    async fn enqueue(&self, entry: DispatchEntry, delay: Duration) -> Result<()> {
        trace!(job_id = %entry.job_id, priority = entry.priority, ?delay, "enqueue");
        {
            let mut inner = self.lock();
            if delay.is_zero() {
                inner.push_ready(entry);
            } else {
                inner.delayed.push(Delayed {
                    due: Instant::now() + delay,
                    entry,
                });
            }
        }
        self.notify.notify_one();
        record_op("enqueue");
        Ok(())
    }

    async fn claim(&self) -> Result<Option<DispatchEntry>> {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return Ok(None);
            }

            // Register interest before looking so an enqueue in between is not lost.
            let notified = self.notify.notified();

            let next_due = {
                let mut inner = self.lock();
                if let Some(entry) = inner.pop(Instant::now()) {
                    let more = !inner.ready.is_empty();
                    drop(inner);
                    if more {
                        self.notify.notify_one();
                    }
                    record_op("claim");
                    return Ok(Some(entry));
                }
                inner.next_due()
            };

            let wake_at = async {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = notified => {}
                _ = wake_at => {}
                _ = closed.changed() => {}
            }
        }
    }

    async fn try_claim(&self) -> Result<Option<DispatchEntry>> {
        if self.is_closed() {
            return Ok(None);
        }
        let entry = self.lock().pop(Instant::now());
        record_op(if entry.is_some() { "claim" } else { "claim_empty" });
        Ok(entry)
    }

    async fn remove(&self, job_id: JobId) -> Result<bool> {
        let mut inner = self.lock();
        let before = inner.ready.len() + inner.delayed.len();
        inner.ready.retain(|r| r.entry.job_id != job_id);
        inner.delayed.retain(|d| d.entry.job_id != job_id);
        let removed = inner.ready.len() + inner.delayed.len() < before;
        drop(inner);
        record_op("remove");
        Ok(removed)
    }

    async fn ack(&self, job_id: JobId, outcome: AckOutcome) -> Result<()> {
        let mut inner = self.lock();
        inner.active.remove(&job_id);
        match outcome {
            AckOutcome::Completed => inner.completed += 1,
            AckOutcome::Failed => inner.failed += 1,
            AckOutcome::Retried | AckOutcome::Discarded => {}
        }
        drop(inner);
        record_op("ack");
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let mut inner = self.lock();
        inner.promote_due(Instant::now());
        Ok(QueueCounts {
            waiting: inner.ready.len() as u64,
            delayed: inner.delayed.len() as u64,
            active: inner.active.len() as u64,
            completed: inner.completed,
            failed: inner.failed,
        })
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}
