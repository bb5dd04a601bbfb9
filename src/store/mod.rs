//! Job Record Store: durable, keyed storage for job documents.
//!
//! Implementations must make each `update` atomic for a single record.
//! No cross-record transactions are required.

mod memory;

pub use memory::MemoryJobStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{JobFilter, JobId, JobRecord, JobStatus, JobUpdate, OwnerId, PageRequest, StatusCounts};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new record. The record's `job_id` must not exist yet.
    async fn create(&self, record: &JobRecord) -> Result<()>;

    /// Fetch by id regardless of owner. Used by workers.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Fetch by id, visible only to its owner.
    async fn get_for_owner(&self, id: JobId, owner: &OwnerId) -> Result<Option<JobRecord>>;

    /// First record of `owner` carrying `key`, in any status.
    async fn find_by_idempotency_key(&self, owner: &OwnerId, key: &str)
    -> Result<Option<JobRecord>>;

    /// One page of an owner's records, newest first, plus the total
    /// number of records matching `filter`.
    async fn list(
        &self,
        owner: &OwnerId,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<(Vec<JobRecord>, u64)>;

    /// Apply `update` to one record. When `expect` is set, the write only
    /// happens if the record is currently in that status. A status change
    /// the lifecycle does not allow (see [`JobUpdate::permits`]) is never
    /// written.
    ///
    /// Returns the updated record, or `None` if the record is absent, the
    /// status guard did not hold, or the transition was refused.
    async fn update(
        &self,
        id: JobId,
        expect: Option<JobStatus>,
        update: &JobUpdate,
    ) -> Result<Option<JobRecord>>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: JobId) -> Result<bool>;

    /// Record counts per status for one owner.
    async fn count_by_status(&self, owner: &OwnerId) -> Result<StatusCounts>;
}
