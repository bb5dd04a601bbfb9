//! Service handles built once at startup and passed to every component.

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::info;

use crate::config::Config;
use crate::db::{Db, PgQueue};
use crate::error::Result;
use crate::queue::{DispatchQueue, MemoryQueue};
use crate::store::{JobStore, MemoryJobStore};
use crate::worker::WorkRegistry;

#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn DispatchQueue>,
    pub registry: Arc<WorkRegistry>,
}

impl AppContext {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        registry: Arc<WorkRegistry>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
        }
    }

    /// Store and queue kept in process memory. Nothing survives a restart.
    pub fn in_memory(registry: Arc<WorkRegistry>) -> Self {
        Self::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryQueue::new()),
            registry,
        )
    }

    /// Connect to Postgres, apply migrations, and back both the store and
    /// the queue with it. Any failure here aborts startup.
    pub async fn connect(config: &Config, registry: Arc<WorkRegistry>) -> Result<Self> {
        let db = Db::connect(config.database_url.expose_secret()).await?;
        db.migrate().await?;
        db.health_check().await?;
        info!("database ready");

        let queue = PgQueue::new(db.clone(), config.poll_interval);
        Ok(Self::new(Arc::new(db), Arc::new(queue), registry))
    }
}
