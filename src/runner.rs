//! Per-task runner: the sleep/wake/evaluate/execute loop and the handle
//! embedders hold.
//!
//! ```text
//! TaskRunner loop
//!     │
//!     ├─► load schedule row
//!     ├─► sleep (master: until next_run, ≤ 2 min; slave: 15 min) | wake | shutdown
//!     ├─► reload row, re-check master flag
//!     ├─► run_once or next_run due?
//!     │       ├─► paused: advance next_run, skip
//!     │       └─► active: insert Started run → callback(RunContext)
//!     │               → resolve terminal status → persist next_run → retention
//!     └─► repeat
//! ```
//!
//! Nothing escapes the loop: repository and callback failures are logged,
//! the runner backs off five seconds and continues. Shutdown is the only
//! exit.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TaskConfig;
use crate::context::{Completion, RunContext};
use crate::cron::CronExpression;
use crate::error::SchedulerError;
use crate::model::{RunStatus, Schedule, ScheduleRun};
use crate::repository::ScheduleRepository;

/// Upper bound on one master-mode sleep; the runner re-evaluates at least
/// this often while holding the lock.
const MASTER_SLEEP_MAX: StdDuration = StdDuration::from_secs(2 * 60);
/// Sleep between evaluations while another node is master.
const SLAVE_SLEEP: StdDuration = StdDuration::from_secs(15 * 60);
/// Pause after a repository or scheduling error before retrying.
const ERROR_BACKOFF: StdDuration = StdDuration::from_secs(5);

/// User work invoked by a runner. Implemented for any
/// `Fn(RunContext) -> Future<Output = Result<Completion>>` closure.
pub trait TaskCallback: Send + Sync + 'static {
    fn run(&self, ctx: RunContext) -> BoxFuture<'static, Result<Completion>>;
}

impl<F, Fut> TaskCallback for F
where
    F: Fn(RunContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Completion>> + Send + 'static,
{
    fn run(&self, ctx: RunContext) -> BoxFuture<'static, Result<Completion>> {
        (self)(ctx).boxed()
    }
}

/// Mutable runner state, guarded by one mutex.
#[derive(Default)]
pub(crate) struct RunnerState {
    pub(crate) override_cron: Option<CronExpression>,
    pub(crate) next_run: Option<DateTime<Utc>>,
    pub(crate) active: bool,
    pub(crate) run_once: bool,
    pub(crate) currently_running: bool,
    pub(crate) last_run_started: Option<DateTime<Utc>>,
    pub(crate) last_run_completed: Option<DateTime<Utc>>,
}

/// Everything a runner loop and its handle share.
pub(crate) struct RunnerShared {
    pub(crate) config: TaskConfig,
    pub(crate) default_cron: CronExpression,
    pub(crate) repository: Arc<dyn ScheduleRepository>,
    pub(crate) callback: Arc<dyn TaskCallback>,
    pub(crate) hostname: String,
    pub(crate) master_flag: Arc<AtomicBool>,
    pub(crate) wake: Arc<Notify>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) state: Mutex<RunnerState>,
    pub(crate) test_mode: bool,
}

impl RunnerShared {
    pub(crate) fn locked(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to one registered task. Cheap to clone; all control-plane
/// operations go through it.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<RunnerShared>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}

impl TaskHandle {
    pub(crate) fn new(shared: Arc<RunnerShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &TaskConfig {
        &self.shared.config
    }

    pub fn default_cron(&self) -> &str {
        self.shared.default_cron.as_str()
    }

    /// The expression currently governing fire times: the override if one is
    /// set, else the default.
    pub fn active_cron(&self) -> String {
        self.shared
            .locked()
            .override_cron
            .as_ref()
            .map(|c| c.as_str().to_string())
            .unwrap_or_else(|| self.shared.default_cron.as_str().to_string())
    }

    pub fn is_active(&self) -> bool {
        self.shared.locked().active
    }

    pub fn is_running(&self) -> bool {
        self.shared.locked().currently_running
    }

    /// Whether the current run has exceeded the configured expectation.
    /// Diagnostic only; the run is never interrupted.
    pub fn is_overdue(&self) -> bool {
        let state = self.shared.locked();
        is_overdue_at(
            self.shared.config.max_expected_minutes_to_run,
            state.currently_running,
            state.last_run_started,
            Utc::now(),
        )
    }

    /// Minutes the current run has been executing, zero when idle.
    pub fn run_time_in_minutes(&self) -> i64 {
        let state = self.shared.locked();
        match (state.currently_running, state.last_run_started) {
            (true, Some(started)) => (Utc::now() - started).num_minutes(),
            _ => 0,
        }
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.shared.locked().next_run
    }

    pub fn last_run_started(&self) -> Option<DateTime<Utc>> {
        self.shared.locked().last_run_started
    }

    pub fn last_run_completed(&self) -> Option<DateTime<Utc>> {
        self.shared.locked().last_run_completed
    }

    /// Resume a paused task.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.shared
            .repository
            .set_active(self.name(), true)
            .await?;
        self.shared.locked().active = true;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Pause the task: fire times keep advancing but the callback is
    /// skipped.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.shared
            .repository
            .set_active(self.name(), false)
            .await?;
        self.shared.locked().active = false;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Trigger one execution regardless of `next_run`.
    ///
    /// Normally this sets the persistent run-once flag and wakes the runner;
    /// the run happens on whichever node is master. In test mode it drives a
    /// full execution cycle inline on the caller's task.
    pub async fn run_now(&self) -> Result<(), SchedulerError> {
        if self.shared.test_mode {
            execute_run(&self.shared, Utc::now()).await?;
            return Ok(());
        }
        self.shared
            .repository
            .set_run_once(self.name(), true)
            .await?;
        self.shared.locked().run_once = true;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Replace the cron expression at runtime. `None` or an empty string
    /// clears the override and reverts to the default. The new `next_run`
    /// is computed and persisted, and the runner is woken.
    pub async fn set_override_expression(
        &self,
        expression: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let cleaned = expression.map(str::trim).filter(|s| !s.is_empty());
        match cleaned {
            Some(text) => {
                let parsed = CronExpression::parse(text)?;
                let next = parsed.next_after(Utc::now());
                self.shared
                    .repository
                    .update_next_run(self.name(), Some(text), next)
                    .await?;
                let mut state = self.shared.locked();
                state.override_cron = Some(parsed);
                state.next_run = next;
            }
            None => {
                let next = self.shared.default_cron.next_after(Utc::now());
                self.shared
                    .repository
                    .update_next_run(self.name(), None, next)
                    .await?;
                let mut state = self.shared.locked();
                state.override_cron = None;
                state.next_run = next;
            }
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    pub async fn last_schedule_run(&self) -> Result<Option<ScheduleRun>, SchedulerError> {
        Ok(self
            .shared
            .repository
            .get_last_run_for_schedule(self.name())
            .await?)
    }

    pub async fn schedule_runs_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRun>, SchedulerError> {
        Ok(self
            .shared
            .repository
            .get_schedule_runs_between(self.name(), from, to)
            .await?)
    }

    /// One run by id.
    pub async fn instance(&self, run_id: i64) -> Result<Option<ScheduleRun>, SchedulerError> {
        Ok(self.shared.repository.get_schedule_run(run_id).await?)
    }
}

/// How long to sleep before the next evaluation.
fn sleep_duration(
    is_master: bool,
    next_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> StdDuration {
    if !is_master {
        return SLAVE_SLEEP;
    }
    match next_run {
        None => MASTER_SLEEP_MAX,
        Some(next) => {
            let until = next - now;
            if until <= chrono::Duration::zero() {
                StdDuration::ZERO
            } else {
                until.to_std().unwrap_or(MASTER_SLEEP_MAX).min(MASTER_SLEEP_MAX)
            }
        }
    }
}

fn is_overdue_at(
    max_expected_minutes: i64,
    currently_running: bool,
    run_started: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if max_expected_minutes <= 0 || !currently_running {
        return false;
    }
    match run_started {
        Some(started) => (now - started).num_minutes() >= max_expected_minutes,
        None => false,
    }
}

/// Refresh in-memory state from a freshly loaded row.
fn sync_from_row(shared: &RunnerShared, row: &Schedule) {
    let mut state = shared.locked();
    state.active = row.active;
    state.run_once = row.run_once;
    state.next_run = row.next_run;
    match &row.overridden_cron {
        None => state.override_cron = None,
        Some(text) => {
            let cached = state
                .override_cron
                .as_ref()
                .is_some_and(|c| c.as_str() == text);
            if !cached {
                match CronExpression::parse(text) {
                    Ok(parsed) => state.override_cron = Some(parsed),
                    Err(e) => {
                        // Stored overrides are validated on the way in, so
                        // this indicates outside tampering. Fall back to the
                        // default expression.
                        warn!(task = %row.name, error = %e, "stored override does not parse");
                        state.override_cron = None;
                    }
                }
            }
        }
    }
}

/// The expression governing the next fire time for this row.
fn resolve_active_cron(shared: &RunnerShared, row: &Schedule) -> CronExpression {
    match &row.overridden_cron {
        None => shared.default_cron.clone(),
        Some(text) => {
            let cached = {
                let state = shared.locked();
                state
                    .override_cron
                    .as_ref()
                    .filter(|c| c.as_str() == text)
                    .cloned()
            };
            cached.unwrap_or_else(|| {
                CronExpression::parse(text).unwrap_or_else(|_| shared.default_cron.clone())
            })
        }
    }
}

/// Sleep out the error backoff; returns true when shutdown arrived instead.
async fn error_pause(shared: &RunnerShared) -> bool {
    tokio::select! {
        _ = shared.shutdown.cancelled() => true,
        _ = tokio::time::sleep(ERROR_BACKOFF) => false,
    }
}

/// Long-lived runner loop; one per registered task.
pub(crate) async fn run_loop(shared: Arc<RunnerShared>) {
    let name = shared.config.name.clone();
    info!(task = %name, cron = %shared.default_cron, "task runner starting");

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        // Load the schedule row to decide how long to sleep.
        let row = match shared.repository.get_schedule(&name).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(task = %name, "schedule row missing");
                if error_pause(&shared).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(task = %name, error = %e, "failed to load schedule");
                if error_pause(&shared).await {
                    break;
                }
                continue;
            }
        };
        sync_from_row(&shared, &row);

        let is_master = shared.master_flag.load(Ordering::SeqCst);
        let sleep_for = sleep_duration(is_master, row.next_run, Utc::now());
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }

        // Values may have changed while asleep; reload before evaluating.
        let row = match shared.repository.get_schedule(&name).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(task = %name, "schedule row missing");
                if error_pause(&shared).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(task = %name, error = %e, "failed to reload schedule");
                if error_pause(&shared).await {
                    break;
                }
                continue;
            }
        };
        sync_from_row(&shared, &row);

        if shared.shutdown.is_cancelled() {
            break;
        }
        if !shared.master_flag.load(Ordering::SeqCst) {
            continue;
        }

        let now = Utc::now();
        if row.run_once {
            // Clear the flag before executing so a concurrent trigger cannot
            // double-schedule.
            if let Err(e) = shared.repository.set_run_once(&name, false).await {
                warn!(task = %name, error = %e, "failed to clear run-once flag");
                if error_pause(&shared).await {
                    break;
                }
                continue;
            }
            shared.locked().run_once = false;
            if let Err(e) = execute_or_skip(&shared, &row, now).await {
                warn!(task = %name, error = %e, "cycle failed");
                if error_pause(&shared).await {
                    break;
                }
            }
            continue;
        }

        match row.next_run {
            // No reachable fire time; only run-once triggers execute.
            None => continue,
            Some(next) if now < next => continue,
            Some(_) => {
                if let Err(e) = execute_or_skip(&shared, &row, now).await {
                    warn!(task = %name, error = %e, "cycle failed");
                    if error_pause(&shared).await {
                        break;
                    }
                }
            }
        }
    }

    info!(task = %shared.config.name, "task runner stopped");
}

/// One due cycle: skip-but-advance when paused, execute otherwise.
async fn execute_or_skip(
    shared: &RunnerShared,
    row: &Schedule,
    now: DateTime<Utc>,
) -> Result<()> {
    if !row.active {
        let cron = resolve_active_cron(shared, row);
        let next = cron.next_after(now);
        shared
            .repository
            .update_next_run(&row.name, row.overridden_cron.as_deref(), next)
            .await?;
        shared.locked().next_run = next;
        debug!(task = %row.name, next = ?next, "task paused; advancing next run");
        return Ok(());
    }
    execute_run(shared, now).await
}

/// Execute the callback once and persist the outcome: run row, terminal
/// status, next fire time, retention.
pub(crate) async fn execute_run(shared: &RunnerShared, now: DateTime<Utc>) -> Result<()> {
    let name = shared.config.name.clone();
    let previous = shared.repository.get_last_run_for_schedule(&name).await?;
    let run_id = shared
        .repository
        .add_schedule_run(&name, &shared.hostname, now, "run started")
        .await?;

    {
        let mut state = shared.locked();
        state.currently_running = true;
        state.last_run_started = Some(now);
    }
    info!(task = %name, run_id, "executing scheduled task");

    let ctx = RunContext::new(
        run_id,
        name.clone(),
        shared.hostname.clone(),
        now,
        previous,
        shared.repository.clone(),
    );
    let outcome = AssertUnwindSafe(shared.callback.run(ctx)).catch_unwind().await;

    let status_time = Utc::now();
    match outcome {
        Ok(Ok(completion)) if completion.run_id() == run_id => {
            debug!(task = %name, run_id, "task callback completed");
        }
        Ok(Ok(completion)) => {
            let msg = format!(
                "callback returned a completion for run {} instead of run {run_id}",
                completion.run_id()
            );
            warn!(task = %name, run_id, "{msg}");
            mark_failed(shared, run_id, status_time, &msg, None).await;
        }
        Ok(Err(e)) => {
            warn!(task = %name, run_id, error = %e, "task callback failed");
            mark_failed(
                shared,
                run_id,
                status_time,
                &format!("callback failed: {e:#}"),
                Some(format!("{e:?}")),
            )
            .await;
        }
        Err(panic) => {
            let msg = panic_message(panic);
            error!(task = %name, run_id, panic = %msg, "task callback panicked");
            mark_failed(
                shared,
                run_id,
                status_time,
                &format!("callback panicked: {msg}"),
                Some(msg),
            )
            .await;
        }
    }

    // Schedule the next cycle only after the run's outcome is durable.
    let row = shared
        .repository
        .get_schedule(&name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("schedule row for '{name}' disappeared"))?;
    let cron = resolve_active_cron(shared, &row);
    let next = cron.next_after(Utc::now());
    shared
        .repository
        .update_next_run(&name, row.overridden_cron.as_deref(), next)
        .await?;

    {
        let mut state = shared.locked();
        state.currently_running = false;
        state.last_run_completed = Some(Utc::now());
        state.next_run = next;
    }

    shared
        .repository
        .execute_retention_policy(&name, &shared.config.retention_policy, Utc::now())
        .await?;

    Ok(())
}

/// Record a failure status for a run whose callback did not do so itself.
/// Losing the race against an already-written terminal status is fine.
async fn mark_failed(
    shared: &RunnerShared,
    run_id: i64,
    status_time: DateTime<Utc>,
    msg: &str,
    stacktrace: Option<String>,
) {
    match shared
        .repository
        .set_status(run_id, RunStatus::Failed, status_time, msg, stacktrace.as_deref())
        .await
    {
        Ok(()) => {
            if let Err(e) = shared
                .repository
                .add_log_entry(
                    run_id,
                    status_time,
                    &format!("[FAILED] {msg}"),
                    stacktrace.as_deref(),
                )
                .await
            {
                warn!(run_id, error = %e, "failed to append failure log entry");
            }
        }
        Err(e) => {
            debug!(run_id, error = %e, "failure status not recorded (already terminal?)");
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
