//! Core data model.
//!
//! `JobRecord` is the only persistent entity. Everything else here is a
//! projection of it (dispatch entries) or a query shape over it.

pub mod job;

pub use job::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default page size for `list`.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;
/// Largest page `list` will return, whatever the caller asks for.
pub const MAX_PAGE_LIMIT: u32 = 100;

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Queue-resident projection of a job. The job record stays authoritative
/// for status; this only carries what a worker needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEntry {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
}

/// Live broker counters. `completed` and `failed` are cumulative since the
/// broker started; the rest are current.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Eligible for claim now.
    pub waiting: u64,
    /// Inside a retry backoff window, not yet eligible.
    pub delayed: u64,
    /// Claimed by a worker and not yet acknowledged.
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Optional filters for `list`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
}

impl JobFilter {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn job_type(mut self, job_type: impl Into<JobType>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.job_type.as_ref().is_none_or(|t| &record.job_type == t)
    }
}

/// Resolved page window. Construct with [`PageRequest::new`] so the limit
/// is clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u64,
}

impl PageRequest {
    pub fn new(limit: Option<u32>, offset: Option<u64>) -> Self {
        let limit = limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);
        Self {
            limit,
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
    pub has_more: bool,
}

/// One page of `list`, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<JobRecord>,
    pub pagination: Pagination,
}

impl JobPage {
    pub fn new(jobs: Vec<JobRecord>, total: u64, page: PageRequest) -> Self {
        let has_more = page.offset + (jobs.len() as u64) < total;
        Self {
            jobs,
            pagination: Pagination {
                total,
                limit: page.limit,
                offset: page.offset,
                has_more,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Per-status record counts for one owner. Statuses with no records are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCounts(pub BTreeMap<JobStatus, u64>);

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn add(&mut self, status: JobStatus, n: u64) {
        if n > 0 {
            *self.0.entry(status).or_insert(0) += n;
        }
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

impl FromIterator<(JobStatus, u64)> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = (JobStatus, u64)>>(iter: I) -> Self {
        let mut counts = StatusCounts::default();
        for (status, n) in iter {
            counts.add(status, n);
        }
        counts
    }
}

/// Owner-scoped record counts merged with global broker counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub user: StatusCounts,
    pub queue: QueueCounts,
}
