//! Per-run handle passed into user callbacks.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::model::{RunStatus, ScheduleLogEntry, ScheduleRun};
use crate::repository::ScheduleRepository;

/// Proof that a callback resolved its run.
///
/// Only the terminal methods on [`RunContext`] can mint one, so a callback
/// cannot return successfully without completing the run. The runner checks
/// that the token belongs to the run it handed out.
#[derive(Debug)]
pub struct Completion {
    run_id: i64,
}

impl Completion {
    pub(crate) fn run_id(&self) -> i64 {
        self.run_id
    }
}

struct StatusSnapshot {
    status: RunStatus,
    msg: String,
    stacktrace: Option<String>,
    time: DateTime<Utc>,
}

struct ContextInner {
    run_id: i64,
    schedule_name: String,
    hostname: String,
    run_started: DateTime<Utc>,
    previous_run: Option<ScheduleRun>,
    repository: Arc<dyn ScheduleRepository>,
    status: Mutex<StatusSnapshot>,
}

/// Handle a callback uses to record log lines and its terminal status
/// against one run id. Cheap to clone.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<ContextInner>,
}

impl RunContext {
    pub(crate) fn new(
        run_id: i64,
        schedule_name: String,
        hostname: String,
        run_started: DateTime<Utc>,
        previous_run: Option<ScheduleRun>,
        repository: Arc<dyn ScheduleRepository>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                run_id,
                schedule_name,
                hostname,
                run_started,
                previous_run,
                repository,
                status: Mutex::new(StatusSnapshot {
                    status: RunStatus::Started,
                    msg: String::new(),
                    stacktrace: None,
                    time: run_started,
                }),
            }),
        }
    }

    /// Append a log line to this run.
    pub async fn log(&self, msg: &str) -> Result<()> {
        self.inner
            .repository
            .add_log_entry(self.inner.run_id, Utc::now(), msg, None)
            .await
    }

    /// Append a log line carrying an error's debug rendering as stacktrace.
    pub async fn log_with_error(&self, msg: &str, error: &anyhow::Error) -> Result<()> {
        self.inner
            .repository
            .add_log_entry(
                self.inner.run_id,
                Utc::now(),
                msg,
                Some(&format!("{error:?}")),
            )
            .await
    }

    /// Mark the run successful.
    pub async fn done(&self, msg: &str) -> Result<Completion> {
        self.finish(RunStatus::Done, msg, None).await
    }

    /// Mark the run failed.
    pub async fn failed(&self, msg: &str) -> Result<Completion> {
        self.finish(RunStatus::Failed, msg, None).await
    }

    /// Mark the run failed, capturing the error's message chain.
    pub async fn failed_with_error(&self, msg: &str, error: &anyhow::Error) -> Result<Completion> {
        self.finish(
            RunStatus::Failed,
            &format!("{msg}: {error:#}"),
            Some(format!("{error:?}")),
        )
        .await
    }

    /// Mark the run handed off to another asynchronous worker. Terminal for
    /// the scheduling engine; the dispatched work's fate is not tracked.
    pub async fn dispatched(&self, msg: &str) -> Result<Completion> {
        self.finish(RunStatus::Dispatched, msg, None).await
    }

    async fn finish(
        &self,
        status: RunStatus,
        msg: &str,
        stacktrace: Option<String>,
    ) -> Result<Completion> {
        let now = Utc::now();
        self.inner
            .repository
            .set_status(self.inner.run_id, status, now, msg, stacktrace.as_deref())
            .await?;
        self.inner
            .repository
            .add_log_entry(
                self.inner.run_id,
                now,
                &format!("[{}] {}", status.as_label(), msg),
                stacktrace.as_deref(),
            )
            .await?;

        let mut snapshot = self
            .inner
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        snapshot.status = status;
        snapshot.msg = msg.to_string();
        snapshot.stacktrace = stacktrace;
        snapshot.time = now;

        Ok(Completion {
            run_id: self.inner.run_id,
        })
    }

    pub fn run_id(&self) -> i64 {
        self.inner.run_id
    }

    pub fn schedule_name(&self) -> &str {
        &self.inner.schedule_name
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn run_started(&self) -> DateTime<Utc> {
        self.inner.run_started
    }

    /// The most recent run before this one, if any.
    pub fn previous_run(&self) -> Option<&ScheduleRun> {
        self.inner.previous_run.as_ref()
    }

    pub fn status(&self) -> RunStatus {
        self.snapshot(|s| s.status)
    }

    pub fn status_msg(&self) -> String {
        self.snapshot(|s| s.msg.clone())
    }

    pub fn status_stacktrace(&self) -> Option<String> {
        self.snapshot(|s| s.stacktrace.clone())
    }

    pub fn status_time(&self) -> DateTime<Utc> {
        self.snapshot(|s| s.time)
    }

    /// All log entries recorded for this run so far.
    pub async fn log_entries(&self) -> Result<Vec<ScheduleLogEntry>> {
        self.inner
            .repository
            .get_log_entries(self.inner.run_id)
            .await
    }

    fn snapshot<T>(&self, read: impl FnOnce(&StatusSnapshot) -> T) -> T {
        let snapshot = self
            .inner
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        read(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    async fn context_for_run(repo: &Arc<InMemoryRepository>) -> RunContext {
        repo.upsert_schedule("a", "* * * * * *", None).await.unwrap();
        let started = Utc::now();
        let run_id = repo
            .add_schedule_run("a", "host", started, "run started")
            .await
            .unwrap();
        RunContext::new(
            run_id,
            "a".to_string(),
            "host".to_string(),
            started,
            None,
            repo.clone() as Arc<dyn ScheduleRepository>,
        )
    }

    #[tokio::test]
    async fn done_writes_status_and_bracketed_log_line() {
        let repo = Arc::new(InMemoryRepository::new());
        let ctx = context_for_run(&repo).await;

        let completion = ctx.done("all good").await.unwrap();
        assert_eq!(completion.run_id(), ctx.run_id());

        let run = repo
            .get_schedule_run(ctx.run_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.status_msg, "all good");
        assert!(run.status_time >= run.run_start);

        let entries = ctx.log_entries().await.unwrap();
        assert_eq!(entries.last().unwrap().message, "[DONE] all good");
    }

    #[tokio::test]
    async fn second_terminal_call_fails() {
        let repo = Arc::new(InMemoryRepository::new());
        let ctx = context_for_run(&repo).await;

        ctx.done("first").await.unwrap();
        assert!(ctx.failed("second").await.is_err());
        assert_eq!(ctx.status(), RunStatus::Done);
    }

    #[tokio::test]
    async fn failed_with_error_captures_the_chain() {
        let repo = Arc::new(InMemoryRepository::new());
        let ctx = context_for_run(&repo).await;

        let error = anyhow::anyhow!("connection reset").context("fetching feed");
        ctx.failed_with_error("sync failed", &error).await.unwrap();

        let run = repo
            .get_schedule_run(ctx.run_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.status_msg.contains("sync failed"));
        assert!(run.status_msg.contains("fetching feed"));
        let stacktrace = run.status_stacktrace.unwrap();
        assert!(stacktrace.contains("connection reset"));
    }

    #[tokio::test]
    async fn dispatched_is_terminal() {
        let repo = Arc::new(InMemoryRepository::new());
        let ctx = context_for_run(&repo).await;

        ctx.log("handing off to worker pool").await.unwrap();
        ctx.dispatched("queued 42 items").await.unwrap();

        assert_eq!(ctx.status(), RunStatus::Dispatched);
        assert!(ctx.status().is_terminal());
        let entries = ctx.log_entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message, "[DISPATCHED] queued 42 items");
    }
}
