//! Durable storage contract for schedules, runs, logs, and the master lock.
//!
//! The engine talks to storage exclusively through [`ScheduleRepository`].
//! Two implementations ship with the crate:
//! - [`PostgresRepository`] for production
//! - [`InMemoryRepository`] for deterministic tests
//!
//! Concurrency correctness rests on two properties every implementation must
//! honor: lock mutations are conditional writes (two nodes can never both
//! win), and terminal status writes are single-shot per run id.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::RetentionPolicy;
use crate::model::{MasterLock, RunStatus, Schedule, ScheduleLogEntry, ScheduleRun};

mod memory;
mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;

/// Data access contract for the scheduling engine.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Fetch one schedule row by name.
    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>>;

    /// Idempotent creation of a schedule row. On conflict the existing
    /// `active`, `overridden_cron`, `next_run`, and `run_once` values are
    /// preserved. `default_cron` is informational (the row does not store
    /// it); implementations log it on first creation.
    async fn upsert_schedule(
        &self,
        name: &str,
        default_cron: &str,
        initial_next_run: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn set_active(&self, name: &str, active: bool) -> Result<()>;

    async fn set_run_once(&self, name: &str, run_once: bool) -> Result<()>;

    /// Atomic write of the override-and-next pair.
    async fn update_next_run(
        &self,
        name: &str,
        overridden_cron: Option<&str>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Insert a run with status `Started`; returns the assigned run id.
    /// Run ids are unique and monotonically increasing.
    async fn add_schedule_run(
        &self,
        name: &str,
        hostname: &str,
        run_start: DateTime<Utc>,
        initial_msg: &str,
    ) -> Result<i64>;

    /// Single-shot terminal transition. A repeat terminal write for the same
    /// run id is rejected with an error.
    async fn set_status(
        &self,
        run_id: i64,
        status: RunStatus,
        status_time: DateTime<Utc>,
        msg: &str,
        stacktrace: Option<&str>,
    ) -> Result<()>;

    async fn add_log_entry(
        &self,
        run_id: i64,
        log_time: DateTime<Utc>,
        message: &str,
        stacktrace: Option<&str>,
    ) -> Result<()>;

    /// Log entries for one run, in insertion order.
    async fn get_log_entries(&self, run_id: i64) -> Result<Vec<ScheduleLogEntry>>;

    async fn get_last_run_for_schedule(&self, name: &str) -> Result<Option<ScheduleRun>>;

    /// Runs with `from <= run_start <= to`, ordered by start time.
    async fn get_schedule_runs_between(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRun>>;

    async fn get_schedule_run(&self, run_id: i64) -> Result<Option<ScheduleRun>>;

    async fn count_runs_for_schedule(&self, name: &str) -> Result<u64>;

    /// Delete runs older than the policy horizon or beyond the per-task
    /// count cap, and their log entries when the policy says so.
    async fn execute_retention_policy(
        &self,
        name: &str,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_all_schedules(&self) -> Result<HashMap<String, Schedule>>;

    /// Claim the lock. Succeeds if no row exists or the existing row is
    /// older than the validity window. Must be a conditional write.
    async fn try_acquire_lock(
        &self,
        lock_name: &str,
        node_name: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Heartbeat the lock. Succeeds only if this node holds the row and it
    /// is still within the validity window; refreshes
    /// `lock_last_updated_time`.
    async fn keep_lock(&self, lock_name: &str, node_name: &str, now: DateTime<Utc>)
        -> Result<bool>;

    async fn get_lock(&self, lock_name: &str) -> Result<Option<MasterLock>>;

    /// Best-effort release on shutdown; only removes the row if this node
    /// holds it.
    async fn release_lock(&self, lock_name: &str, node_name: &str) -> Result<()>;
}
