//! Service facade wiring the store, queue, adapters and token manager
//!
//! The three binaries build one [`CrosscastService`] from configuration and
//! take the parts they need from it, so they always share the same queue
//! name, clock and adapter registry.
//!
//! ```no_run
//! use libcrosscast::service::CrosscastService;
//!
//! # async fn example() -> libcrosscast::Result<()> {
//! let service = CrosscastService::new().await?;
//! let stats = service.admin().queue_stats().await?;
//! println!("{} waiting", stats.waiting);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::admin::AdminService;
use crate::clock::{self, Clock};
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::lifecycle::PostLifecycle;
use crate::platforms::AdapterRegistry;
use crate::queue::JobQueue;
use crate::scheduler::RefreshScheduler;
use crate::tokens::TokenManager;
use crate::worker::PublishWorker;

#[derive(Clone)]
pub struct CrosscastService {
    config: Arc<Config>,
    db: Database,
    queue: JobQueue,
    adapters: AdapterRegistry,
    tokens: Arc<TokenManager>,
    clock: Arc<dyn Clock>,
}

impl CrosscastService {
    /// Load configuration from the default location and open the database
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    pub async fn from_config(config: Config) -> Result<Self> {
        let adapters = AdapterRegistry::from_config(&config.platforms)?;
        Self::with_parts(config, adapters, clock::system()).await
    }

    /// Build with explicit adapters and clock; tests use this with mocks
    pub async fn with_parts(
        config: Config,
        adapters: AdapterRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let db = Database::new(&config.database.path).await?;
        let queue = JobQueue::new(db.clone(), clock.clone());
        let tokens = Arc::new(TokenManager::new(
            db.clone(),
            adapters.clone(),
            clock.clone(),
            &config.tokens,
        ));

        Ok(Self {
            config: Arc::new(config),
            db,
            queue,
            adapters,
            tokens,
            clock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn tokens(&self) -> Arc<TokenManager> {
        self.tokens.clone()
    }

    pub fn worker(&self) -> PublishWorker {
        PublishWorker::new(
            self.db.clone(),
            self.queue.clone(),
            self.adapters.clone(),
            self.tokens.clone(),
            self.clock.clone(),
            &self.config.worker,
        )
    }

    pub fn admin(&self) -> AdminService {
        AdminService::new(
            self.db.clone(),
            self.queue.clone(),
            self.tokens.clone(),
            self.clock.clone(),
        )
    }

    pub fn lifecycle(&self) -> PostLifecycle {
        PostLifecycle::new(self.db.clone(), self.queue.clone(), self.clock.clone())
    }

    pub fn refresh_scheduler(&self) -> Result<RefreshScheduler> {
        let interval = self.config.tokens.refresh_interval()?;
        Ok(RefreshScheduler::new(self.tokens.clone(), interval))
    }
}
