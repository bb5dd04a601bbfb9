//! jobq CLI: run the worker pool and operate on jobs.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use jobq::config::Config;
use jobq::context::AppContext;
use jobq::db::Db;
use jobq::model::{JobFilter, JobId, JobStatus, NewJob, OwnerId};
use jobq::service::JobService;
use jobq::telemetry::{TelemetryConfig, init_telemetry};
use jobq::worker::{WorkRegistry, WorkerPool, builtin};
use secrecy::ExposeSecret;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "jobq", about = "Priority job queue with retries and backoff")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool until interrupted
    Serve {
        /// Override JOBQ_WORKERS
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Apply database migrations and exit
    Migrate,
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a new job
    Submit {
        /// Job type (execution, file-processing, analysis, export)
        job_type: String,
        #[arg(long)]
        owner: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Priority, 1 (lowest) to 10 (highest)
        #[arg(long, default_value_t = 5)]
        priority: i32,
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// List an owner's jobs, newest first
    List {
        #[arg(long)]
        owner: String,
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by job type
        #[arg(long = "type")]
        job_type: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u64>,
    },
    /// Show one job
    Show {
        id: String,
        #[arg(long)]
        owner: String,
    },
    /// Cancel a pending job
    Cancel {
        id: String,
        #[arg(long)]
        owner: String,
    },
    /// Retry a failed job
    Retry {
        id: String,
        #[arg(long)]
        owner: String,
    },
    /// Status counts for an owner plus live queue counts
    Stats {
        #[arg(long)]
        owner: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { workers } => cmd_serve(config, workers).await,
        Command::Migrate => {
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;
            println!("migrations applied");
            Ok(())
        }
        Command::Job { action } => {
            let ctx = AppContext::connect(&config, default_registry()).await?;
            let service = JobService::new(&ctx).with_default_max_attempts(config.max_attempts);
            cmd_job(&service, action).await
        }
    }
}

fn default_registry() -> Arc<WorkRegistry> {
    let registry = WorkRegistry::new();
    builtin::register_defaults(&registry);
    Arc::new(registry)
}

async fn cmd_serve(config: Config, workers: Option<usize>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "jobq"))?;

    let ctx = AppContext::connect(&config, default_registry()).await?;

    let mut worker_config = config.worker_config();
    if let Some(n) = workers {
        worker_config.concurrency = n;
    }
    let pool = WorkerPool::new(&ctx, worker_config);
    pool.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!(active = pool.active(), "interrupt received, draining workers");
    pool.shutdown().await;
    Ok(())
}

async fn cmd_job(service: &JobService, action: JobAction) -> anyhow::Result<()> {
    match action {
        JobAction::Submit {
            job_type,
            owner,
            payload,
            priority,
            idempotency_key,
        } => {
            let payload: serde_json::Value = match payload {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::json!({}),
            };
            let mut new = NewJob::new(job_type.as_str())
                .payload(payload)
                .priority(priority);
            if let Some(key) = idempotency_key {
                new = new.idempotency_key(key);
            }
            print_json(&service.submit(&OwnerId::new(owner), new).await?)
        }
        JobAction::List {
            owner,
            status,
            job_type,
            limit,
            offset,
        } => {
            let mut filter = JobFilter::default();
            if let Some(s) = status {
                filter = filter.status(s.parse::<JobStatus>()?);
            }
            if let Some(t) = job_type {
                filter = filter.job_type(t.as_str());
            }
            print_json(&service.list(&OwnerId::new(owner), &filter, limit, offset).await?)
        }
        JobAction::Show { id, owner } => {
            print_json(&service.get(id.parse::<JobId>()?, &OwnerId::new(owner)).await?)
        }
        JobAction::Cancel { id, owner } => {
            print_json(&service.cancel(id.parse::<JobId>()?, &OwnerId::new(owner)).await?)
        }
        JobAction::Retry { id, owner } => {
            print_json(&service.retry(id.parse::<JobId>()?, &OwnerId::new(owner)).await?)
        }
        JobAction::Stats { owner } => print_json(&service.stats(&OwnerId::new(owner)).await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
