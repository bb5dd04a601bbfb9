//! Integration tests for the worker pool over in-memory backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use jobq::context::AppContext;
use jobq::error::{Error, Result};
use jobq::model::*;
use jobq::queue::{DispatchQueue, MemoryQueue};
use jobq::service::JobService;
use jobq::store::{JobStore, MemoryJobStore};
use jobq::worker::{RetryPolicy, WorkRegistry, WorkResult, WorkerConfig, WorkerPool, builtin};
use serde_json::{Value, json};

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 3,
        rate_per_sec: 1_000,
        retry: RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
    }
}

struct Harness {
    ctx: AppContext,
    service: JobService,
    pool: WorkerPool,
}

fn harness(registry: WorkRegistry, config: WorkerConfig) -> Harness {
    harness_with_store(registry, Arc::new(MemoryJobStore::new()), config)
}

fn harness_with_store(
    registry: WorkRegistry,
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
) -> Harness {
    builtin::register_defaults(&registry);
    let ctx = AppContext::new(store, Arc::new(MemoryQueue::new()), Arc::new(registry));
    let service = JobService::new(&ctx);
    let pool = WorkerPool::new(&ctx, config);
    pool.start();
    Harness { ctx, service, pool }
}

/// Memory store that fails a set number of worker reads and completion
/// writes before behaving normally.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryJobStore,
    failing_gets: AtomicU32,
    failing_completions: AtomicU32,
}

impl FlakyStore {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create(&self, record: &JobRecord) -> Result<()> {
        self.inner.create(record).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        if Self::take(&self.failing_gets) {
            return Err(Error::Other("store offline".to_string()));
        }
        self.inner.get(id).await
    }

    async fn get_for_owner(&self, id: JobId, owner: &OwnerId) -> Result<Option<JobRecord>> {
        self.inner.get_for_owner(id, owner).await
    }

    async fn find_by_idempotency_key(
        &self,
        owner: &OwnerId,
        key: &str,
    ) -> Result<Option<JobRecord>> {
        self.inner.find_by_idempotency_key(owner, key).await
    }

    async fn list(
        &self,
        owner: &OwnerId,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<(Vec<JobRecord>, u64)> {
        self.inner.list(owner, filter, page).await
    }

    async fn update(
        &self,
        id: JobId,
        expect: Option<JobStatus>,
        update: &JobUpdate,
    ) -> Result<Option<JobRecord>> {
        if update.status == Some(JobStatus::Completed) && Self::take(&self.failing_completions) {
            return Err(Error::Other("store offline".to_string()));
        }
        self.inner.update(id, expect, update).await
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn count_by_status(&self, owner: &OwnerId) -> Result<StatusCounts> {
        self.inner.count_by_status(owner).await
    }
}

/// Work fn that counts its calls and then returns `result`.
fn register_counted(registry: &WorkRegistry, job_type: &str, result: WorkResult) -> Arc<AtomicU32> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    registry.register(job_type, move |_payload: Value| {
        let counter = Arc::clone(&counter);
        let result = result.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            result
        }
    });
    calls
}

fn owner() -> OwnerId {
    OwnerId::new("worker-test")
}

/// Poll until the job reaches a terminal status.
async fn wait_terminal(service: &JobService, id: JobId) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = service.get(id, &owner()).await.unwrap();
        assert!(job.attempts <= job.max_attempts, "attempt bound broken: {job:?}");
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn successful_job_completes_with_result() {
    let h = harness(WorkRegistry::new(), fast_config());

    let job = h
        .service
        .submit(&owner(), NewJob::new(JobType::export()).payload(json!({"a": 1})))
        .await
        .unwrap()
        .job;

    let done = wait_terminal(&h.service, job.job_id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 1);
    assert!(done.error.is_none());
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    let result = done.result.unwrap();
    assert_eq!(result["type"], "export");
    assert_eq!(result["echo"], json!({"a": 1}));

    h.pool.shutdown().await;
    let counts = h.ctx.queue.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.active, 0);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let registry = WorkRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    registry.register("flaky", move |_payload: Value| {
        let counter = Arc::clone(&counter);
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("transient #{n}"))
            } else {
                Ok(json!({"calls": n}))
            }
        }
    });
    let h = harness(registry, fast_config());

    let job = h
        .service
        .submit(&owner(), NewJob::new("flaky"))
        .await
        .unwrap()
        .job;

    let done = wait_terminal(&h.service, job.job_id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 3);
    assert_eq!(done.result, Some(json!({"calls": 3})));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn exhausted_attempts_end_failed_at_the_bound() {
    let registry = WorkRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    registry.register("doomed", move |_payload: Value| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>("upstream rejected".to_string())
        }
    });
    let h = harness(registry, fast_config());

    let job = h
        .service
        .submit(&owner(), NewJob::new("doomed"))
        .await
        .unwrap()
        .job;

    let done = wait_terminal(&h.service, job.job_id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.attempts, done.max_attempts);
    assert_eq!(done.error.as_deref(), Some("upstream rejected"));
    assert!(done.result.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    h.pool.shutdown().await;
    assert_eq!(h.ctx.queue.counts().await.unwrap().failed, 1);
}

#[tokio::test]
async fn failed_job_can_be_retried_manually() {
    let registry = WorkRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    // Fails on the first pass of attempts, then recovers.
    registry.register("recovers", move |_payload: Value| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("not yet".to_string())
            } else {
                Ok(json!("ok"))
            }
        }
    });
    let h = harness(registry, fast_config());

    let job = h
        .service
        .submit(&owner(), NewJob::new("recovers").max_attempts(2))
        .await
        .unwrap()
        .job;
    let failed = wait_terminal(&h.service, job.job_id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 2);

    h.service.retry(job.job_id, &owner()).await.unwrap();
    let done = wait_terminal(&h.service, job.job_id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 1);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn panicking_work_function_counts_as_failure() {
    let registry = WorkRegistry::new();
    registry.register("panics", |_payload: Value| async move {
        if true {
            panic!("work function bug");
        }
        Ok(Value::Null)
    });
    let h = harness(registry, fast_config());

    let job = h
        .service
        .submit(&owner(), NewJob::new("panics").max_attempts(2))
        .await
        .unwrap()
        .job;

    let done = wait_terminal(&h.service, job.job_id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.attempts, 2);
    assert_eq!(done.error.as_deref(), Some("work function panicked"));

    // The pool survived and still runs jobs.
    let next = h
        .service
        .submit(&owner(), NewJob::new(JobType::analysis()))
        .await
        .unwrap()
        .job;
    assert_eq!(
        wait_terminal(&h.service, next.job_id).await.status,
        JobStatus::Completed
    );

    h.pool.shutdown().await;
}

#[tokio::test]
async fn unregistered_type_fails_without_retry() {
    let h = harness(WorkRegistry::new(), fast_config());

    // Bypass submit validation, as if the type was unregistered after submission.
    let record = JobRecord::pending(owner(), NewJob::new("retired-type"));
    h.ctx.store.create(&record).await.unwrap();
    h.ctx
        .queue
        .enqueue(record.dispatch_entry(), Duration::ZERO)
        .await
        .unwrap();

    let done = wait_terminal(&h.service, record.job_id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.attempts, 1);
    assert!(done.error.unwrap().contains("retired-type"));

    h.pool.shutdown().await;
}

#[tokio::test]
async fn entry_for_cancelled_record_is_skipped() {
    let registry = WorkRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    registry.register("counted", move |_payload: Value| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });
    let h = harness(registry, fast_config());

    // Record already cancelled, but a stale entry is still in the queue.
    let record = JobRecord::pending(owner(), NewJob::new("counted"));
    h.ctx.store.create(&record).await.unwrap();
    h.ctx
        .store
        .update(record.job_id, None, &JobUpdate::failed(CANCELLED_BY_USER))
        .await
        .unwrap();
    h.ctx
        .queue
        .enqueue(record.dispatch_entry(), Duration::ZERO)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.pool.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let job = h.service.get(record.job_id, &owner()).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.error.as_deref(), Some(CANCELLED_BY_USER));
}

#[tokio::test]
async fn store_error_before_claim_requeues_the_entry() {
    let store = Arc::new(FlakyStore::default());
    store.failing_gets.store(1, Ordering::SeqCst);
    let config = WorkerConfig {
        concurrency: 1,
        ..fast_config()
    };
    let h = harness_with_store(WorkRegistry::new(), store.clone(), config);

    let job = h
        .service
        .submit(&owner(), NewJob::new(JobType::export()))
        .await
        .unwrap()
        .job;

    let done = wait_terminal(&h.service, job.job_id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 1);
    assert_eq!(store.failing_gets.load(Ordering::SeqCst), 0);

    h.pool.shutdown().await;
    let counts = h.ctx.queue.counts().await.unwrap();
    assert_eq!(counts.active, 0);
    assert_eq!(counts.completed, 1);
    assert_eq!(h.pool.active(), 0);
}

#[tokio::test]
async fn store_error_while_settling_reruns_the_attempt() {
    let registry = WorkRegistry::new();
    let calls = register_counted(&registry, "counted", Ok(json!("ok")));
    let store = Arc::new(FlakyStore::default());
    store.failing_completions.store(1, Ordering::SeqCst);
    let h = harness_with_store(registry, store, fast_config());

    let job = h
        .service
        .submit(&owner(), NewJob::new("counted"))
        .await
        .unwrap()
        .job;

    // The first result could not be recorded, so the job ran once more.
    let done = wait_terminal(&h.service, job.job_id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    h.pool.shutdown().await;
    assert_eq!(h.ctx.queue.counts().await.unwrap().active, 0);
}

#[tokio::test]
async fn store_error_on_final_attempt_fails_the_job() {
    let registry = WorkRegistry::new();
    let calls = register_counted(&registry, "counted", Ok(json!("ok")));
    let store = Arc::new(FlakyStore::default());
    store.failing_completions.store(1, Ordering::SeqCst);
    let h = harness_with_store(registry, store, fast_config());

    let job = h
        .service
        .submit(&owner(), NewJob::new("counted").max_attempts(1))
        .await
        .unwrap()
        .job;

    let done = wait_terminal(&h.service, job.job_id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.attempts, 1);
    assert!(done.error.unwrap().contains("store offline"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    h.pool.shutdown().await;
    let counts = h.ctx.queue.counts().await.unwrap();
    assert_eq!(counts.active, 0);
    assert_eq!(counts.failed, 1);
}

#[tokio::test]
async fn cancel_during_backoff_stops_further_attempts() {
    let registry = WorkRegistry::new();
    let calls = register_counted(&registry, "doomed", Err("upstream rejected".to_string()));
    let config = WorkerConfig {
        retry: RetryPolicy {
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(300),
        },
        ..fast_config()
    };
    let h = harness(registry, config);

    let job = h
        .service
        .submit(&owner(), NewJob::new("doomed"))
        .await
        .unwrap()
        .job;

    // Wait for the first failure to land in the backoff window.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let record = h.service.get(job.job_id, &owner()).await.unwrap();
        let delayed = h.ctx.queue.counts().await.unwrap().delayed;
        if record.status == JobStatus::Pending && record.attempts == 1 && delayed == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "never backed off: {record:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    h.service.cancel(job.job_id, &owner()).await.unwrap();
    assert_eq!(h.ctx.queue.counts().await.unwrap().delayed, 0);

    // Let the backoff window pass: nothing runs the job again.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let cancelled = h.service.get(job.job_id, &owner()).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.attempts, 1);
    assert_eq!(cancelled.error.as_deref(), Some(CANCELLED_BY_USER));

    h.pool.shutdown().await;
}

#[tokio::test]
async fn claims_respect_pool_rate_limit() {
    let config = WorkerConfig {
        concurrency: 5,
        rate_per_sec: 5,
        ..fast_config()
    };
    let h = harness(WorkRegistry::new(), config);

    let start = std::time::Instant::now();
    let mut ids = Vec::new();
    for _ in 0..10 {
        let job = h
            .service
            .submit(&owner(), NewJob::new(JobType::execution()))
            .await
            .unwrap()
            .job;
        ids.push(job.job_id);
    }
    for id in ids {
        wait_terminal(&h.service, id).await;
    }

    // Five claims come from the initial burst; the other five wait for refill.
    assert!(start.elapsed() >= Duration::from_millis(800));
    h.pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_idle_workers() {
    let h = harness(WorkRegistry::new(), fast_config());
    tokio::time::timeout(Duration::from_secs(2), h.pool.shutdown())
        .await
        .expect("idle pool should stop promptly");
    assert_eq!(h.pool.active(), 0);
}
