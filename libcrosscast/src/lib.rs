//! Crosscast - scheduled publishing to social platforms
//!
//! This library holds the durable job queue, the publish worker, OAuth
//! token management and the platform adapters shared by the `cross-send`
//! daemon, the `cross-queue` CLI and the `cross-admin` server.

pub mod admin;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod platforms;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod tokens;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use admin::AdminService;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::Database;
pub use error::{CrosscastError, Result};
pub use lifecycle::PostLifecycle;
pub use platforms::{AdapterRegistry, ErrorKind, PlatformAdapter};
pub use queue::{Job, JobQueue, JobState, QueueStats};
pub use scheduler::{RefreshRun, RefreshScheduler};
pub use service::CrosscastService;
pub use tokens::TokenManager;
pub use types::{Platform, Post, PostStatus, Profile};
pub use worker::{Outcome, PublishWorker};
