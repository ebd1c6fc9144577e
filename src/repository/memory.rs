//! In-memory repository for tests.
//!
//! Mirrors the Postgres implementation's semantics (conditional lock writes,
//! single-shot terminal transitions, retention) so the engine can be driven
//! deterministically without a database. Also useful in embedders' own test
//! suites.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::RetentionPolicy;
use crate::model::{
    MasterLock, RunStatus, Schedule, ScheduleLogEntry, ScheduleRun, LOCK_VALIDITY_SECS,
};

use super::ScheduleRepository;

#[derive(Default)]
struct MemoryState {
    schedules: HashMap<String, Schedule>,
    runs: BTreeMap<i64, ScheduleRun>,
    logs: Vec<ScheduleLogEntry>,
    locks: HashMap<String, MasterLock>,
    next_run_id: i64,
    next_log_id: i64,
}

/// Repository backed by process memory.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<MemoryState>,
    fail_all: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guard(&self) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            bail!("injected repository failure");
        }
        Ok(())
    }

    /// Make every operation fail until cleared. Lets tests exercise the
    /// engine's repository-error paths.
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Shift a lock row's timestamps into the past, simulating a holder
    /// that stopped heartbeating.
    pub fn backdate_lock(&self, lock_name: &str, by: Duration) {
        let mut state = self.locked();
        if let Some(lock) = state.locks.get_mut(lock_name) {
            lock.lock_taken_time -= by;
            lock.lock_last_updated_time -= by;
        }
    }

    /// Drop all stored state.
    pub fn clear(&self) {
        let mut state = self.locked();
        *state = MemoryState::default();
    }
}

fn stale_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(LOCK_VALIDITY_SECS)
}

#[async_trait]
impl ScheduleRepository for InMemoryRepository {
    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>> {
        self.guard()?;
        Ok(self.locked().schedules.get(name).cloned())
    }

    async fn upsert_schedule(
        &self,
        name: &str,
        default_cron: &str,
        initial_next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.guard()?;
        let mut state = self.locked();
        if !state.schedules.contains_key(name) {
            tracing::debug!(task = %name, cron = %default_cron, "creating schedule row");
            state.schedules.insert(
                name.to_string(),
                Schedule {
                    name: name.to_string(),
                    active: true,
                    overridden_cron: None,
                    next_run: initial_next_run,
                    run_once: false,
                    last_updated: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn set_active(&self, name: &str, active: bool) -> Result<()> {
        self.guard()?;
        let mut state = self.locked();
        match state.schedules.get_mut(name) {
            Some(schedule) => {
                schedule.active = active;
                schedule.last_updated = Utc::now();
                Ok(())
            }
            None => bail!("unknown schedule '{name}'"),
        }
    }

    async fn set_run_once(&self, name: &str, run_once: bool) -> Result<()> {
        self.guard()?;
        let mut state = self.locked();
        match state.schedules.get_mut(name) {
            Some(schedule) => {
                schedule.run_once = run_once;
                schedule.last_updated = Utc::now();
                Ok(())
            }
            None => bail!("unknown schedule '{name}'"),
        }
    }

    async fn update_next_run(
        &self,
        name: &str,
        overridden_cron: Option<&str>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.guard()?;
        let mut state = self.locked();
        match state.schedules.get_mut(name) {
            Some(schedule) => {
                schedule.overridden_cron = overridden_cron.map(str::to_string);
                schedule.next_run = next_run;
                schedule.last_updated = Utc::now();
                Ok(())
            }
            None => bail!("unknown schedule '{name}'"),
        }
    }

    async fn add_schedule_run(
        &self,
        name: &str,
        hostname: &str,
        run_start: DateTime<Utc>,
        initial_msg: &str,
    ) -> Result<i64> {
        self.guard()?;
        let mut state = self.locked();
        state.next_run_id += 1;
        let run_id = state.next_run_id;
        state.runs.insert(
            run_id,
            ScheduleRun {
                run_id,
                schedule_name: name.to_string(),
                hostname: hostname.to_string(),
                status: RunStatus::Started,
                status_msg: initial_msg.to_string(),
                status_stacktrace: None,
                run_start,
                status_time: run_start,
            },
        );
        Ok(run_id)
    }

    async fn set_status(
        &self,
        run_id: i64,
        status: RunStatus,
        status_time: DateTime<Utc>,
        msg: &str,
        stacktrace: Option<&str>,
    ) -> Result<()> {
        self.guard()?;
        let mut state = self.locked();
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Started => {
                run.status = status;
                run.status_msg = msg.to_string();
                run.status_stacktrace = stacktrace.map(str::to_string);
                run.status_time = status_time;
                Ok(())
            }
            Some(run) => bail!(
                "run {run_id} already has terminal status {:?}",
                run.status
            ),
            None => bail!("unknown run {run_id}"),
        }
    }

    async fn add_log_entry(
        &self,
        run_id: i64,
        log_time: DateTime<Utc>,
        message: &str,
        stacktrace: Option<&str>,
    ) -> Result<()> {
        self.guard()?;
        let mut state = self.locked();
        state.next_log_id += 1;
        let log_id = state.next_log_id;
        state.logs.push(ScheduleLogEntry {
            log_id,
            run_id,
            log_time,
            message: message.to_string(),
            stacktrace: stacktrace.map(str::to_string),
        });
        Ok(())
    }

    async fn get_log_entries(&self, run_id: i64) -> Result<Vec<ScheduleLogEntry>> {
        self.guard()?;
        Ok(self
            .locked()
            .logs
            .iter()
            .filter(|entry| entry.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn get_last_run_for_schedule(&self, name: &str) -> Result<Option<ScheduleRun>> {
        self.guard()?;
        Ok(self
            .locked()
            .runs
            .values()
            .filter(|run| run.schedule_name == name)
            .max_by_key(|run| (run.run_start, run.run_id))
            .cloned())
    }

    async fn get_schedule_runs_between(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRun>> {
        self.guard()?;
        let state = self.locked();
        let mut runs: Vec<ScheduleRun> = state
            .runs
            .values()
            .filter(|run| run.schedule_name == name && run.run_start >= from && run.run_start <= to)
            .cloned()
            .collect();
        runs.sort_by_key(|run| (run.run_start, run.run_id));
        Ok(runs)
    }

    async fn get_schedule_run(&self, run_id: i64) -> Result<Option<ScheduleRun>> {
        self.guard()?;
        Ok(self.locked().runs.get(&run_id).cloned())
    }

    async fn count_runs_for_schedule(&self, name: &str) -> Result<u64> {
        self.guard()?;
        Ok(self
            .locked()
            .runs
            .values()
            .filter(|run| run.schedule_name == name)
            .count() as u64)
    }

    async fn execute_retention_policy(
        &self,
        name: &str,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.guard()?;
        let mut state = self.locked();
        let horizon = now - policy.max_age;

        let mut kept: Vec<i64> = state
            .runs
            .values()
            .filter(|run| run.schedule_name == name)
            .map(|run| run.run_id)
            .collect();
        // Newest first, matching the count cap's "keep the most recent" rule.
        kept.sort_by_key(|id| {
            let run = &state.runs[id];
            (run.run_start, run.run_id)
        });
        kept.reverse();

        let mut doomed: Vec<i64> = Vec::new();
        for (index, run_id) in kept.iter().enumerate() {
            let run = &state.runs[run_id];
            if run.run_start < horizon || index as i64 >= policy.max_runs {
                doomed.push(*run_id);
            }
        }

        for run_id in &doomed {
            state.runs.remove(run_id);
        }
        if policy.delete_logs {
            state.logs.retain(|entry| !doomed.contains(&entry.run_id));
        }
        Ok(())
    }

    async fn get_all_schedules(&self) -> Result<HashMap<String, Schedule>> {
        self.guard()?;
        Ok(self.locked().schedules.clone())
    }

    async fn try_acquire_lock(
        &self,
        lock_name: &str,
        node_name: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.guard()?;
        let mut state = self.locked();
        match state.locks.get_mut(lock_name) {
            None => {
                state.locks.insert(
                    lock_name.to_string(),
                    MasterLock {
                        lock_name: lock_name.to_string(),
                        node_name: node_name.to_string(),
                        lock_taken_time: now,
                        lock_last_updated_time: now,
                    },
                );
                Ok(true)
            }
            Some(lock) if lock.lock_last_updated_time < stale_cutoff(now) => {
                lock.node_name = node_name.to_string();
                lock.lock_taken_time = now;
                lock.lock_last_updated_time = now;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn keep_lock(
        &self,
        lock_name: &str,
        node_name: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.guard()?;
        let mut state = self.locked();
        match state.locks.get_mut(lock_name) {
            Some(lock)
                if lock.node_name == node_name
                    && lock.lock_last_updated_time >= stale_cutoff(now) =>
            {
                lock.lock_last_updated_time = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lock(&self, lock_name: &str) -> Result<Option<MasterLock>> {
        self.guard()?;
        Ok(self.locked().locks.get(lock_name).cloned())
    }

    async fn release_lock(&self, lock_name: &str, node_name: &str) -> Result<()> {
        self.guard()?;
        let mut state = self.locked();
        if state
            .locks
            .get(lock_name)
            .is_some_and(|lock| lock.node_name == node_name)
        {
            state.locks.remove(lock_name);
        }
        Ok(())
    }
}
