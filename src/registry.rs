//! Process-wide task registry.
//!
//! Owns the master lock keeper and one runner per registered task. Embedders
//! create one registry per process, register their tasks at startup, and
//! call [`TaskRegistry::shutdown`] on the way out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{RegistryConfig, TaskConfig};
use crate::cron::CronExpression;
use crate::error::SchedulerError;
use crate::lock::{MasterLockKeeper, WakeSet};
use crate::model::{MasterLock, Schedule};
use crate::repository::ScheduleRepository;
use crate::runner::{run_loop, RunnerShared, RunnerState, TaskCallback, TaskHandle};

/// Receives registry lifecycle notifications.
pub trait RegistryListener: Send + Sync {
    fn on_scheduled_task_created(&self, handle: &TaskHandle);
}

#[derive(Default)]
struct RegistryInner {
    tasks: HashMap<String, TaskHandle>,
    listeners: Vec<Arc<dyn RegistryListener>>,
    runner_handles: Vec<JoinHandle<()>>,
    keeper_handle: Option<JoinHandle<()>>,
}

/// Directory of registered tasks plus the lock keeper.
pub struct TaskRegistry {
    config: RegistryConfig,
    repository: Arc<dyn ScheduleRepository>,
    master_flag: Arc<AtomicBool>,
    wakers: Arc<WakeSet>,
    shutdown: CancellationToken,
    inner: Mutex<RegistryInner>,
}

impl TaskRegistry {
    /// Create the registry and start the master lock keeper. Must be called
    /// within a Tokio runtime. In test mode no background work is spawned.
    pub fn start(repository: Arc<dyn ScheduleRepository>, config: RegistryConfig) -> Self {
        let master_flag = Arc::new(AtomicBool::new(false));
        let wakers = Arc::new(WakeSet::default());
        let shutdown = CancellationToken::new();

        let mut inner = RegistryInner::default();
        if !config.test_mode {
            let keeper = MasterLockKeeper::new(
                repository.clone(),
                config.lock_name.clone(),
                config.node_name.clone(),
                master_flag.clone(),
                wakers.clone(),
                shutdown.child_token(),
            );
            inner.keeper_handle = Some(tokio::spawn(keeper.run()));
        }

        Self {
            config,
            repository,
            master_flag,
            wakers,
            shutdown,
            inner: Mutex::new(inner),
        }
    }

    fn locked(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task and start its runner loop (unless in test mode).
    ///
    /// The schedule row is created if missing; an existing row keeps its
    /// operator state (pause flag, override, pending run-once).
    pub async fn register(
        &self,
        config: TaskConfig,
        callback: impl TaskCallback,
    ) -> Result<TaskHandle, SchedulerError> {
        let default_cron = CronExpression::parse(&config.cron_expression)?;
        if self.locked().tasks.contains_key(&config.name) {
            return Err(SchedulerError::DuplicateTask(config.name));
        }

        let initial_next = default_cron.next_after(Utc::now());
        self.repository
            .upsert_schedule(&config.name, &config.cron_expression, initial_next)
            .await?;
        let row = self
            .repository
            .get_schedule(&config.name)
            .await?
            .ok_or_else(|| {
                SchedulerError::Repository(anyhow::anyhow!(
                    "schedule row for '{}' missing after upsert",
                    config.name
                ))
            })?;

        let mut state = RunnerState {
            next_run: row.next_run,
            active: row.active,
            run_once: row.run_once,
            ..RunnerState::default()
        };
        if let Some(text) = &row.overridden_cron {
            match CronExpression::parse(text) {
                Ok(parsed) => state.override_cron = Some(parsed),
                Err(e) => warn!(task = %config.name, error = %e, "stored override does not parse"),
            }
        }

        let wake = Arc::new(Notify::new());
        self.wakers.add(wake.clone());

        let name = config.name.clone();
        let shared = Arc::new(RunnerShared {
            config,
            default_cron,
            repository: self.repository.clone(),
            callback: Arc::new(callback),
            hostname: self.config.node_name.clone(),
            master_flag: self.master_flag.clone(),
            wake,
            shutdown: self.shutdown.child_token(),
            state: Mutex::new(state),
            test_mode: self.config.test_mode,
        });
        let handle = TaskHandle::new(shared.clone());

        let listeners = {
            let mut inner = self.locked();
            if !self.config.test_mode {
                inner.runner_handles.push(tokio::spawn(run_loop(shared)));
            }
            inner.tasks.insert(name.clone(), handle.clone());
            inner.listeners.clone()
        };
        info!(task = %name, "registered scheduled task");
        for listener in listeners {
            listener.on_scheduled_task_created(&handle);
        }

        Ok(handle)
    }

    /// Handles for every registered task.
    pub fn scheduled_tasks(&self) -> HashMap<String, TaskHandle> {
        self.locked().tasks.clone()
    }

    pub fn get(&self, name: &str) -> Option<TaskHandle> {
        self.locked().tasks.get(name).cloned()
    }

    /// All schedule rows as the repository sees them, including rows left by
    /// nodes that registered other tasks.
    pub async fn schedules_from_repository(
        &self,
    ) -> Result<HashMap<String, Schedule>, SchedulerError> {
        Ok(self.repository.get_all_schedules().await?)
    }

    /// The current lock row, whichever node holds it.
    pub async fn master_lock(&self) -> Result<Option<MasterLock>, SchedulerError> {
        Ok(self.repository.get_lock(&self.config.lock_name).await?)
    }

    /// Whether this node currently holds the master lock.
    pub fn has_master_lock(&self) -> bool {
        self.master_flag.load(Ordering::SeqCst)
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn is_test_mode(&self) -> bool {
        self.config.test_mode
    }

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.locked().listeners.push(listener);
    }

    /// Stop every runner and the lock keeper, releasing the lock.
    ///
    /// Runners finish any callback already executing before exiting; this
    /// waits for them.
    pub async fn shutdown(&self) {
        info!(node = %self.config.node_name, "task registry shutting down");
        self.shutdown.cancel();
        self.wakers.wake_all();

        let (runner_handles, keeper_handle) = {
            let mut inner = self.locked();
            (
                std::mem::take(&mut inner.runner_handles),
                inner.keeper_handle.take(),
            )
        };
        for handle in runner_handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "runner task ended abnormally");
            }
        }
        if let Some(handle) = keeper_handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "lock keeper task ended abnormally");
            }
        }
        info!(node = %self.config.node_name, "task registry stopped");
    }
}
