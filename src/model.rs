//! Persisted records for the scheduling engine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// How long a master lock stays valid past its last heartbeat.
///
/// A holder whose `lock_last_updated_time` is older than this window is
/// considered to have lost the lock, and any node may claim it.
pub const LOCK_VALIDITY_SECS: i64 = 5 * 60;

/// Lifecycle status of a single run.
///
/// A run is created in `Started` and transitions at most once to one of the
/// terminal states. `Dispatched` means the callback handed the work off to
/// another subsystem; from the engine's perspective the run is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Done,
    Failed,
    Dispatched,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Started)
    }

    /// Uppercase label used in `"[STATE] message"` log entries.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunStatus::Started => "STARTED",
            RunStatus::Done => "DONE",
            RunStatus::Failed => "FAILED",
            RunStatus::Dispatched => "DISPATCHED",
        }
    }
}

/// One row per registered task, keyed by unique name.
///
/// `next_run` is the earliest instant the task may next fire; `None` means
/// the active cron expression cannot produce a future fire time and the task
/// only runs via the run-once flag.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    /// False pauses the task: scheduled times are still advanced but the
    /// callback is skipped.
    pub active: bool,
    pub overridden_cron: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
    /// One-shot flag: the next eligible cycle fires immediately regardless
    /// of `next_run`, then the flag resets.
    pub run_once: bool,
    pub last_updated: DateTime<Utc>,
}

impl Schedule {
    /// The expression currently governing fire times.
    pub fn active_cron<'a>(&'a self, default_cron: &'a str) -> &'a str {
        self.overridden_cron.as_deref().unwrap_or(default_cron)
    }
}

/// One row per execution attempt.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub run_id: i64,
    pub schedule_name: String,
    /// Node that executed the run; opaque identification only.
    pub hostname: String,
    pub status: RunStatus,
    pub status_msg: String,
    pub status_stacktrace: Option<String>,
    pub run_start: DateTime<Utc>,
    pub status_time: DateTime<Utc>,
}

/// Append-only log line recorded against one run.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleLogEntry {
    pub log_id: i64,
    pub run_id: i64,
    pub log_time: DateTime<Utc>,
    pub message: String,
    pub stacktrace: Option<String>,
}

/// The single cluster-wide lock row.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct MasterLock {
    pub lock_name: String,
    pub node_name: String,
    pub lock_taken_time: DateTime<Utc>,
    pub lock_last_updated_time: DateTime<Utc>,
}

impl MasterLock {
    /// Whether the holder is still within the validity window at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.lock_last_updated_time)
            < Duration::seconds(LOCK_VALIDITY_SECS)
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_valid_at(now)
    }
}
