//! Work function registry, indexed by job type.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::task::JoinError;

use crate::model::JobType;

/// What a work function hands back: a JSON result or an error message.
pub type WorkResult = std::result::Result<Value, String>;

type BoxedWorkFn =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = WorkResult> + Send>> + Send + Sync>;

/// Why a single execution did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    #[error("no work function registered for job type {0}")]
    Unregistered(JobType),

    #[error("{0}")]
    Failed(String),

    #[error("work function panicked")]
    Panicked,

    #[error("work function was cancelled")]
    Cancelled,
}

impl WorkError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, WorkError::Unregistered(_))
    }
}

/// Maps job types to the async functions that execute them.
pub struct WorkRegistry {
    functions: RwLock<HashMap<JobType, BoxedWorkFn>>,
}

impl Default for WorkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the work function for `job_type`.
    pub fn register<F, Fut>(&self, job_type: impl Into<JobType>, work: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkResult> + Send + 'static,
    {
        let work = Arc::new(work);
        let boxed: BoxedWorkFn = Arc::new(move |payload: Value| {
            let work = Arc::clone(&work);
            Box::pin(async move { work(payload).await })
        });
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_type.into(), boxed);
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(job_type)
    }

    /// Registered types, sorted by name.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self
            .functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }

    /// Run the work function for `job_type` on its own task so a panic
    /// surfaces as [`WorkError::Panicked`] instead of killing the worker.
    pub async fn execute(&self, job_type: &JobType, payload: Value) -> Result<Value, WorkError> {
        let work = self
            .functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_type)
            .cloned()
            .ok_or_else(|| WorkError::Unregistered(job_type.clone()))?;

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                WorkError::Panicked
            } else {
                WorkError::Cancelled
            }
        };

        tokio::spawn(work(payload))
            .await
            .map_err(join_to_error)?
            .map_err(WorkError::Failed)
    }
}
