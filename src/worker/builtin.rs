//! Stock work functions for the well-known job types.
//!
//! Each one sleeps for `payload.duration_ms` (if given), fails when
//! `payload.fail` is `true`, and otherwise returns a small summary of the
//! payload tagged with the job type.

use std::time::Duration;

use serde_json::{Value, json};

use super::registry::{WorkRegistry, WorkResult};
use crate::model::JobType;

/// Register a work function for every well-known job type.
pub fn register_defaults(registry: &WorkRegistry) {
    for name in [
        JobType::EXECUTION,
        JobType::FILE_PROCESSING,
        JobType::ANALYSIS,
        JobType::EXPORT,
    ] {
        registry.register(name, move |payload| summarize(name, payload));
    }
}

async fn summarize(job_type: &'static str, payload: Value) -> WorkResult {
    if let Some(ms) = payload.get("duration_ms").and_then(Value::as_u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    if payload.get("fail").and_then(Value::as_bool) == Some(true) {
        let reason = payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("requested failure");
        return Err(format!("{job_type}: {reason}"));
    }

    let keys = payload.as_object().map_or(0, |obj| obj.len());
    Ok(json!({
        "type": job_type,
        "keys": keys,
        "echo": payload,
    }))
}
