//! Idempotency guard for submissions.
//!
//! The lookup and the subsequent record creation are two separate store
//! calls. Two concurrent submissions sharing a key can both miss and both
//! create a record; there is no uniqueness constraint on
//! `(owner_id, idempotency_key)` to stop them.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::model::{JobRecord, OwnerId};
use crate::store::JobStore;

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn JobStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Find an existing record of `owner` sharing `key`, in any status.
    pub async fn check(&self, owner: &OwnerId, key: &str) -> Result<Option<JobRecord>> {
        let existing = self.store.find_by_idempotency_key(owner, key).await?;
        if let Some(ref record) = existing {
            debug!(
                owner = %owner,
                idempotency_key = key,
                job_id = %record.job_id,
                status = %record.status,
                "idempotency hit"
            );
        }
        Ok(existing)
    }
}
