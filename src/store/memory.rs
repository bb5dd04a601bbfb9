//! In-process job store.
//!
//! Keeps documents in a map behind a lock. Suitable for tests and for
//! embedding the orchestrator in a single process.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::JobStore;
use crate::error::{Error, Result};
use crate::model::{
    JobFilter, JobId, JobRecord, JobStatus, JobUpdate, OwnerId, PageRequest, StatusCounts,
};

struct Stored {
    /// Insertion order, breaks `created_at` ties.
    seq: u64,
    record: JobRecord,
}

#[derive(Default)]
struct Inner {
    records: HashMap<JobId, Stored>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, record: &JobRecord) -> Result<()> {
        let mut inner = self.write();
        if inner.records.contains_key(&record.job_id) {
            return Err(Error::Other(format!("duplicate job id {}", record.job_id)));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(
            record.job_id,
            Stored {
                seq,
                record: record.clone(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.read().records.get(&id).map(|s| s.record.clone()))
    }

    async fn get_for_owner(&self, id: JobId, owner: &OwnerId) -> Result<Option<JobRecord>> {
        Ok(self
            .read()
            .records
            .get(&id)
            .filter(|s| &s.record.owner_id == owner)
            .map(|s| s.record.clone()))
    }

    async fn find_by_idempotency_key(
        &self,
        owner: &OwnerId,
        key: &str,
    ) -> Result<Option<JobRecord>> {
        let inner = self.read();
        Ok(inner
            .records
            .values()
            .filter(|s| {
                &s.record.owner_id == owner && s.record.idempotency_key.as_deref() == Some(key)
            })
            .min_by_key(|s| s.seq)
            .map(|s| s.record.clone()))
    }

    async fn list(
        &self,
        owner: &OwnerId,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<(Vec<JobRecord>, u64)> {
        let inner = self.read();
        let mut matching: Vec<&Stored> = inner
            .records
            .values()
            .filter(|s| &s.record.owner_id == owner && filter.matches(&s.record))
            .collect();
        matching.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then(b.seq.cmp(&a.seq))
        });

        let total = matching.len() as u64;
        let jobs = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .map(|s| s.record.clone())
            .collect();
        Ok((jobs, total))
    }

    async fn update(
        &self,
        id: JobId,
        expect: Option<JobStatus>,
        update: &JobUpdate,
    ) -> Result<Option<JobRecord>> {
        let mut inner = self.write();
        let Some(stored) = inner.records.get_mut(&id) else {
            return Ok(None);
        };
        if expect.is_some_and(|s| stored.record.status != s) {
            return Ok(None);
        }
        if !update.permits(stored.record.status) {
            return Ok(None);
        }
        update.apply_to(&mut stored.record);
        Ok(Some(stored.record.clone()))
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        Ok(self.write().records.remove(&id).is_some())
    }

    async fn count_by_status(&self, owner: &OwnerId) -> Result<StatusCounts> {
        let inner = self.read();
        Ok(inner
            .records
            .values()
            .filter(|s| &s.record.owner_id == owner)
            .map(|s| (s.record.status, 1))
            .collect())
    }
}
