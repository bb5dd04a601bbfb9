//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in `secrecy::SecretString` so
//! it never ends up in logs.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::DEFAULT_MAX_ATTEMPTS;
use crate::worker::{RetryPolicy, WorkerConfig};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Concurrent workers in the pool.
    pub workers: usize,
    /// Claims per second across the whole pool.
    pub rate_per_sec: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Attempt ceiling given to new jobs.
    pub max_attempts: u32,
    /// How often an idle table-backed queue is polled.
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let workers: usize = optional_var("JOBQ_WORKERS", 5)?;
        let rate_per_sec: u32 = optional_var("JOBQ_RATE_PER_SEC", 10)?;
        let max_attempts: u32 = optional_var("JOBQ_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if workers == 0 || rate_per_sec == 0 || max_attempts == 0 {
            return Err(Error::Config(
                "JOBQ_WORKERS, JOBQ_RATE_PER_SEC and JOBQ_MAX_ATTEMPTS must be positive"
                    .to_string(),
            ));
        }

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            workers,
            rate_per_sec,
            backoff_base: Duration::from_millis(optional_var("JOBQ_BACKOFF_BASE_MS", 1_000)?),
            backoff_max: Duration::from_millis(optional_var("JOBQ_BACKOFF_MAX_MS", 60_000)?),
            max_attempts,
            poll_interval: Duration::from_millis(optional_var("JOBQ_POLL_INTERVAL_MS", 500)?),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.workers,
            rate_per_sec: self.rate_per_sec,
            retry: self.retry_policy(),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is not valid: {e}"))),
        Err(_) => Ok(default),
    }
}
