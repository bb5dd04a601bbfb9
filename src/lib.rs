//! # jobq
//!
//! Asynchronous job orchestration: submission with idempotency keys, a
//! priority dispatch queue, a rate-limited worker pool with retry and
//! backoff, and cancel/retry/stats over durable job records.
//!
//! Store and queue sit behind traits with in-memory and Postgres backends.
//! Observability goes through `tracing` and OpenTelemetry.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod idempotency;
pub mod model;
pub mod queue;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod worker;
