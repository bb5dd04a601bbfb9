//! Job record model.
//!
//! A job is an asynchronous unit of work submitted by an owner. It has
//! identity, a type that selects its work function, an opaque payload,
//! priority, and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lowest accepted priority.
pub const MIN_PRIORITY: i32 = 1;
/// Highest accepted priority.
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Error message recorded on a job cancelled before a worker claimed it.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| Error::Validation(format!("bad job id {s:?}: {e}")))
    }
}

/// Identity of the caller that submitted a job. Resolved by the
/// authentication layer; every query is scoped by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Job type
// ---------------------------------------------------------------------------

/// Category of work. Selects the work function a worker runs.
///
/// The set is open: any name with a registered work function is valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(pub String);

impl JobType {
    pub const EXECUTION: &'static str = "execution";
    pub const FILE_PROCESSING: &'static str = "file-processing";
    pub const ANALYSIS: &'static str = "analysis";
    pub const EXPORT: &'static str = "export";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn execution() -> Self {
        Self::new(Self::EXECUTION)
    }

    pub fn file_processing() -> Self {
        Self::new(Self::FILE_PROCESSING)
    }

    pub fn analysis() -> Self {
        Self::new(Self::ANALYSIS)
    }

    pub fn export() -> Self {
        Self::new(Self::EXPORT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker, either freshly submitted or backing off.
    Pending,
    /// Claimed by a worker and executing.
    Processing,
    /// Work function returned a result. Terminal.
    Completed,
    /// Attempts exhausted or cancelled. Terminal until `retry()`.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending) // backing off before the next attempt
                | (Processing, Failed)
                | (Pending, Failed) // cancelled
                | (Failed, Pending) // retry
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Validation(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// The persistent job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: JobId,

    #[serde(rename = "type")]
    pub job_type: JobType,

    pub status: JobStatus,

    /// Interpreted only by the work function.
    pub payload: serde_json::Value,

    /// Present only when `Completed`.
    pub result: Option<serde_json::Value>,

    /// Present only when `Failed`.
    pub error: Option<String>,

    pub attempts: u32,
    pub max_attempts: u32,

    /// 1 (lowest) to 10 (highest).
    pub priority: i32,

    pub idempotency_key: Option<String>,
    pub owner_id: OwnerId,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Build a fresh `Pending` record for an owner.
    pub fn pending(owner: OwnerId, new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            job_type: new.job_type,
            status: JobStatus::Pending,
            payload: new.payload,
            result: None,
            error: None,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            priority: new.priority,
            idempotency_key: new.idempotency_key,
            owner_id: owner,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Project into the queue-local dispatch entry.
    pub fn dispatch_entry(&self) -> super::DispatchEntry {
        super::DispatchEntry {
            job_id: self.job_id,
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
        }
    }
}

// ---------------------------------------------------------------------------
// Field-level updates
// ---------------------------------------------------------------------------

/// A set of field changes applied atomically to one record.
///
/// `None` leaves a field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub result: Option<Option<serde_json::Value>>,
    pub error: Option<Option<String>>,
    pub attempts: Option<u32>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl JobUpdate {
    /// Worker claimed the job: `Processing`, stamp start, bump attempts.
    pub fn claimed(attempts: u32) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            attempts: Some(attempts),
            started_at: Some(Some(Utc::now())),
            ..Default::default()
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            result: Some(Some(result)),
            error: Some(None),
            completed_at: Some(Some(Utc::now())),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(Some(error.into())),
            completed_at: Some(Some(Utc::now())),
            ..Default::default()
        }
    }

    /// Failed attempt with attempts left: back to `Pending` for the backoff window.
    pub fn backing_off() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            ..Default::default()
        }
    }

    /// Manual retry: clean slate, attempts reset.
    pub fn reset_for_retry() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            result: Some(None),
            error: Some(None),
            attempts: Some(0),
            started_at: Some(None),
            completed_at: Some(None),
        }
    }

    /// Put every mutable field back to what `record` holds.
    pub fn restore(record: &JobRecord) -> Self {
        Self {
            status: Some(record.status),
            result: Some(record.result.clone()),
            error: Some(record.error.clone()),
            attempts: Some(record.attempts),
            started_at: Some(record.started_at),
            completed_at: Some(record.completed_at),
        }
    }

    /// Whether a record in status `from` may take this update. Updates
    /// that leave the status alone, or rewrite the same status, always may.
    pub fn permits(&self, from: JobStatus) -> bool {
        self.status
            .is_none_or(|to| to == from || from.can_transition_to(to))
    }

    /// The statuses [`permits`](Self::permits) accepts, or `None` when the
    /// update does not touch the status.
    pub fn allowed_sources(&self) -> Option<Vec<JobStatus>> {
        self.status.map(|_| {
            JobStatus::ALL
                .into_iter()
                .filter(|&from| self.permits(from))
                .collect()
        })
    }

    /// Apply to an in-memory record. Stores that keep documents in
    /// process use this so every backend shares the same field semantics.
    pub fn apply_to(&self, record: &mut JobRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(ref result) = self.result {
            record.result = result.clone();
        }
        if let Some(ref error) = self.error {
            record.error = error.clone();
        }
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if let Some(started_at) = self.started_at {
            record.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            record.completed_at = completed_at;
        }
        record.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a job submission. The service's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) job_type: JobType,
    pub(crate) payload: serde_json::Value,
    pub(crate) priority: i32,
    pub(crate) idempotency_key: Option<String>,
    /// None = use the service default.
    pub(crate) max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: impl Into<JobType>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: serde_json::Value::Object(Default::default()),
            priority: DEFAULT_PRIORITY,
            idempotency_key: None,
            max_attempts: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    /// Fill in the attempt ceiling if the caller did not choose one.
    pub(crate) fn default_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts.get_or_insert(n);
        self
    }

    /// Reject submissions that must never reach the queue.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(Error::Validation(format!(
                "priority {} out of range [{MIN_PRIORITY}, {MAX_PRIORITY}]",
                self.priority
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::Validation("max_attempts must be at least 1".to_string()));
        }
        if self.job_type.as_str().is_empty() {
            return Err(Error::Validation("job type must not be empty".to_string()));
        }
        if self.idempotency_key.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Validation(
                "idempotency key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<JobType> for NewJob {
    fn from(job_type: JobType) -> Self {
        Self::new(job_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_machine_edges() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn updates_only_permit_lifecycle_edges() {
        use JobStatus::*;
        let done = JobUpdate::completed(json!(1));
        assert!(done.permits(Processing));
        assert!(!done.permits(Pending));
        assert!(!done.permits(Failed));
        assert_eq!(done.allowed_sources(), Some(vec![Processing, Completed]));

        let cancel = JobUpdate::failed(CANCELLED_BY_USER);
        assert!(cancel.permits(Pending));
        assert!(!cancel.permits(Completed));

        assert_eq!(
            JobUpdate::reset_for_retry().allowed_sources(),
            Some(vec![Pending, Processing, Failed])
        );
        let untouched = JobUpdate::default();
        assert!(JobStatus::ALL.into_iter().all(|s| untouched.permits(s)));
        assert_eq!(untouched.allowed_sources(), None);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("dead".parse::<JobStatus>().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_priority() {
        assert!(NewJob::new(JobType::export()).priority(0).validate().is_err());
        assert!(NewJob::new(JobType::export()).priority(11).validate().is_err());
        assert!(NewJob::new(JobType::export()).priority(1).validate().is_ok());
        assert!(NewJob::new(JobType::export()).priority(10).validate().is_ok());
    }

    #[test]
    fn pending_record_has_defaults() {
        let record = JobRecord::pending(
            OwnerId::new("alice"),
            NewJob::new(JobType::analysis()).payload(json!({"a": 1})),
        );
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(record.priority, DEFAULT_PRIORITY);
        assert!(record.started_at.is_none());
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn reset_for_retry_clears_outcome() {
        let mut record = JobRecord::pending(OwnerId::new("alice"), NewJob::new("export"));
        JobUpdate::claimed(3).apply_to(&mut record);
        JobUpdate::failed("boom").apply_to(&mut record);
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.completed_at.is_some());

        JobUpdate::reset_for_retry().apply_to(&mut record);
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.error.is_none());
        assert!(record.result.is_none());
        assert!(record.started_at.is_none());
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = JobRecord::pending(OwnerId::new("alice"), NewJob::new("export"));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "export");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["maxAttempts"], 3);
        assert!(value.get("ownerId").is_some());
    }
}
