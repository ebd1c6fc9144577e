//! Distributed, persistence-backed cron scheduler.
//!
//! Every node in a cluster registers the same set of named tasks at startup.
//! A database-backed master lock elects the single node that actually
//! executes scheduled work; the others stand by, ready to take over within
//! one lock validity window. Each run is recorded durably together with its
//! log trail, so operators can inspect history, trigger manual executions,
//! override schedules at runtime, and pause tasks without restarting
//! anything.
//!
//! # Architecture
//!
//! ```text
//! TaskRegistry
//!     ├─► MasterLockKeeper ──► master_lock row (acquire / heartbeat / release)
//!     └─► TaskRunner per task
//!             ├─► schedule row      (next fire time, pause, override, run-once)
//!             ├─► schedule_run row  (STARTED → DONE | FAILED | DISPATCHED)
//!             └─► schedule_log rows (per-run log trail)
//!
//! user callback ◄── RunContext (log / done / failed / dispatched)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use clustercron::{PostgresRepository, RegistryConfig, TaskConfig, TaskRegistry};
//!
//! let repo = Arc::new(PostgresRepository::connect(&database_url).await?);
//! repo.migrate().await?;
//!
//! let registry = TaskRegistry::start(repo, RegistryConfig::default());
//! registry
//!     .register(TaskConfig::new("nightly-report", "0 0 2 * * *"), |ctx| async move {
//!         ctx.log("building report").await?;
//!         ctx.done("report written").await
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod context;
pub mod cron;
pub mod error;
pub mod model;
pub mod registry;
pub mod repository;
pub mod runner;

mod lock;

pub use config::{Criticality, Recovery, RegistryConfig, RetentionPolicy, TaskConfig};
pub use context::{Completion, RunContext};
pub use self::cron::CronExpression;
pub use error::SchedulerError;
pub use model::{
    MasterLock, RunStatus, Schedule, ScheduleLogEntry, ScheduleRun, LOCK_VALIDITY_SECS,
};
pub use registry::{RegistryListener, TaskRegistry};
pub use repository::{InMemoryRepository, PostgresRepository, ScheduleRepository};
pub use runner::{TaskCallback, TaskHandle};
