//! End-to-end scheduler behavior against the in-memory repository.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use clustercron::{
    Completion, InMemoryRepository, RegistryConfig, RunContext, RunStatus, ScheduleRepository,
    SchedulerError, TaskConfig, TaskRegistry,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn live_registry(repo: &Arc<InMemoryRepository>) -> TaskRegistry {
    TaskRegistry::start(
        repo.clone() as Arc<dyn ScheduleRepository>,
        RegistryConfig::builder().node_name("node-1").build(),
    )
}

fn test_mode_registry(repo: &Arc<InMemoryRepository>) -> TaskRegistry {
    TaskRegistry::start(
        repo.clone() as Arc<dyn ScheduleRepository>,
        RegistryConfig::builder()
            .node_name("node-1")
            .test_mode(true)
            .build(),
    )
}

/// Poll until the condition holds or the deadline passes.
async fn wait_for<F, Fut>(what: &str, deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn single_node_becomes_master_and_fires() {
    init_tracing();
    let repo = Arc::new(InMemoryRepository::new());
    let registry = live_registry(&repo);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_cb = fired.clone();
    registry
        .register(TaskConfig::new("tick", "* * * * * *"), move |ctx: RunContext| {
            let fired = fired_in_cb.clone();
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
                ctx.done("ticked").await
            }
        })
        .await
        .unwrap();

    wait_for("the node to become master", Duration::from_secs(5), || async {
        registry.has_master_lock()
    })
    .await;

    wait_for("a completed run", Duration::from_secs(15), || async {
        matches!(
            repo.get_last_run_for_schedule("tick").await.unwrap(),
            Some(run) if run.status == RunStatus::Done
        )
    })
    .await;

    assert!(fired.load(Ordering::SeqCst) >= 1);
    let run = repo.get_last_run_for_schedule("tick").await.unwrap().unwrap();
    assert_eq!(run.hostname, "node-1");
    assert!(run.status_time >= run.run_start);

    // The next fire time was advanced past the completed run.
    let schedule = repo.get_schedule("tick").await.unwrap().unwrap();
    assert!(schedule.next_run.unwrap() > run.run_start);

    registry.shutdown().await;
}

#[tokio::test]
async fn paused_task_advances_without_running() {
    init_tracing();
    let repo = Arc::new(InMemoryRepository::new());

    // A row left paused by an operator, due in about a second.
    let initial_next = Utc::now() + chrono::Duration::seconds(1);
    repo.upsert_schedule("quiet", "* * * * * *", Some(initial_next))
        .await
        .unwrap();
    repo.set_active("quiet", false).await.unwrap();

    let registry = live_registry(&repo);
    let handle = registry
        .register(TaskConfig::new("quiet", "* * * * * *"), |ctx: RunContext| async move {
            ctx.done("ran").await
        })
        .await
        .unwrap();
    assert!(!handle.is_active());

    wait_for("the fire time to advance", Duration::from_secs(10), || async {
        repo.get_schedule("quiet")
            .await
            .unwrap()
            .unwrap()
            .next_run
            .is_some_and(|next| next > initial_next)
    })
    .await;
    assert_eq!(repo.count_runs_for_schedule("quiet").await.unwrap(), 0);

    // Resuming restores normal execution.
    handle.start().await.unwrap();
    wait_for("a run after resume", Duration::from_secs(15), || async {
        repo.count_runs_for_schedule("quiet").await.unwrap() > 0
    })
    .await;

    registry.shutdown().await;
}

#[tokio::test]
async fn run_now_fires_early_and_clears_the_flag() {
    init_tracing();
    let repo = Arc::new(InMemoryRepository::new());
    let registry = live_registry(&repo);

    // Nightly task: without intervention nothing would fire for hours.
    let handle = registry
        .register(TaskConfig::new("nightly", "0 0 2 * * *"), |ctx: RunContext| async move {
            ctx.done("report written").await
        })
        .await
        .unwrap();

    wait_for("the node to become master", Duration::from_secs(5), || async {
        registry.has_master_lock()
    })
    .await;

    handle.run_now().await.unwrap();
    wait_for("the manual run", Duration::from_secs(10), || async {
        repo.count_runs_for_schedule("nightly").await.unwrap() > 0
    })
    .await;

    let run = repo.get_last_run_for_schedule("nightly").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);

    // The one-shot flag was consumed and the regular schedule survives.
    let schedule = repo.get_schedule("nightly").await.unwrap().unwrap();
    assert!(!schedule.run_once);
    assert!(schedule.next_run.is_some());

    registry.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_runners_and_releases_the_lock() {
    init_tracing();
    let repo = Arc::new(InMemoryRepository::new());
    let registry = live_registry(&repo);
    registry
        .register(TaskConfig::new("tick", "* * * * * *"), |ctx: RunContext| async move {
            ctx.done("ticked").await
        })
        .await
        .unwrap();

    wait_for("the node to become master", Duration::from_secs(5), || async {
        registry.has_master_lock()
    })
    .await;

    registry.shutdown().await;
    assert!(!registry.has_master_lock());
    assert!(repo.get_lock("scheduledtask").await.unwrap().is_none());
}

#[tokio::test]
async fn override_governs_active_cron_until_cleared() {
    let repo = Arc::new(InMemoryRepository::new());
    let registry = test_mode_registry(&repo);
    let handle = registry
        .register(TaskConfig::new("report", "0 */5 * * * *"), |ctx: RunContext| async move {
            ctx.done("ok").await
        })
        .await
        .unwrap();

    handle
        .set_override_expression(Some("*/1 * * * * *"))
        .await
        .unwrap();
    assert_eq!(handle.active_cron(), "*/1 * * * * *");

    let row = repo.get_schedule("report").await.unwrap().unwrap();
    assert_eq!(row.overridden_cron.as_deref(), Some("*/1 * * * * *"));
    // An every-second override puts the next fire time within a second.
    let next = row.next_run.unwrap();
    assert!(next - Utc::now() <= chrono::Duration::seconds(2));

    // Empty string clears like None.
    handle.set_override_expression(Some("")).await.unwrap();
    assert_eq!(handle.active_cron(), "0 */5 * * * *");
    let row = repo.get_schedule("report").await.unwrap().unwrap();
    assert!(row.overridden_cron.is_none());
    assert!(row.next_run.unwrap() > Utc::now());
}

#[tokio::test]
async fn bad_override_is_rejected_and_not_stored() {
    let repo = Arc::new(InMemoryRepository::new());
    let registry = test_mode_registry(&repo);
    let handle = registry
        .register(TaskConfig::new("report", "0 */5 * * * *"), |ctx: RunContext| async move {
            ctx.done("ok").await
        })
        .await
        .unwrap();

    let err = handle
        .set_override_expression(Some("every full moon"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::CronParse { .. }));
    assert_eq!(handle.active_cron(), "0 */5 * * * *");
    let row = repo.get_schedule("report").await.unwrap().unwrap();
    assert!(row.overridden_cron.is_none());
}

#[tokio::test]
async fn failing_callback_records_failure_and_recovers() {
    let repo = Arc::new(InMemoryRepository::new());
    let registry = test_mode_registry(&repo);

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_cb = attempts.clone();
    let handle = registry
        .register(TaskConfig::new("flaky", "0 */5 * * * *"), move |ctx: RunContext| {
            let attempts = attempts_in_cb.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow!("upstream returned 503").context("fetching upstream"))
                } else {
                    ctx.done("recovered").await
                }
            }
        })
        .await
        .unwrap();

    handle.run_now().await.unwrap();
    let first = handle.last_schedule_run().await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Failed);
    assert!(first.status_msg.contains("callback failed"));
    let stacktrace = first.status_stacktrace.as_deref().unwrap();
    assert!(stacktrace.contains("upstream returned 503"));

    // The failure never poisons the runner: the next cycle succeeds.
    handle.run_now().await.unwrap();
    let second = handle.last_schedule_run().await.unwrap().unwrap();
    assert_eq!(second.status, RunStatus::Done);
    assert!(second.run_id > first.run_id);
}

#[tokio::test]
async fn panicking_callback_is_recorded_as_failed() {
    fn recount_ledger() -> usize {
        panic!("invariant violated in callback");
    }

    let repo = Arc::new(InMemoryRepository::new());
    let registry = test_mode_registry(&repo);
    let handle = registry
        .register(TaskConfig::new("explosive", "0 */5 * * * *"), |ctx: RunContext| async move {
            let entries = recount_ledger();
            ctx.done(&format!("recounted {entries} entries")).await
        })
        .await
        .unwrap();

    handle.run_now().await.unwrap();
    let run = handle.last_schedule_run().await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.status_msg.contains("panicked"));
    assert!(run
        .status_stacktrace
        .unwrap()
        .contains("invariant violated"));
}

#[tokio::test]
async fn completion_token_from_another_run_fails_the_run() {
    let repo = Arc::new(InMemoryRepository::new());
    let registry = test_mode_registry(&repo);

    let stash: Arc<Mutex<Option<Completion>>> = Arc::new(Mutex::new(None));
    let stash_in_cb = stash.clone();
    let handle = registry
        .register(TaskConfig::new("smuggler", "0 */5 * * * *"), move |ctx: RunContext| {
            let stash = stash_in_cb.clone();
            async move {
                let stored = stash.lock().unwrap().take();
                match stored {
                    // Second run: hand back the first run's token without
                    // completing anything.
                    Some(token) => Ok(token),
                    None => {
                        let token = ctx.done("legitimate finish").await?;
                        *stash.lock().unwrap() = Some(token);
                        Err(anyhow!("keeping the token for later"))
                    }
                }
            }
        })
        .await
        .unwrap();

    handle.run_now().await.unwrap();
    let first = handle.last_schedule_run().await.unwrap().unwrap();
    // The callback completed before erroring; its status stands.
    assert_eq!(first.status, RunStatus::Done);

    handle.run_now().await.unwrap();
    let second = handle.last_schedule_run().await.unwrap().unwrap();
    assert_eq!(second.status, RunStatus::Failed);
    assert!(second.status_msg.contains("instead of run"));
}

#[tokio::test]
async fn dispatched_counts_as_complete() {
    let repo = Arc::new(InMemoryRepository::new());
    let registry = test_mode_registry(&repo);
    let handle = registry
        .register(TaskConfig::new("handoff", "0 */5 * * * *"), |ctx: RunContext| async move {
            ctx.log("queued 17 items to the worker pool").await?;
            ctx.dispatched("queued").await
        })
        .await
        .unwrap();

    handle.run_now().await.unwrap();
    let run = handle.last_schedule_run().await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Dispatched);

    let logs = repo.get_log_entries(run.run_id).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1].message, "[DISPATCHED] queued");
}

#[tokio::test]
async fn history_is_queryable_through_the_handle() {
    let repo = Arc::new(InMemoryRepository::new());
    let registry = test_mode_registry(&repo);
    let handle = registry
        .register(TaskConfig::new("audit", "0 */5 * * * *"), |ctx: RunContext| async move {
            ctx.done("ok").await
        })
        .await
        .unwrap();

    let before = Utc::now();
    for _ in 0..3 {
        handle.run_now().await.unwrap();
    }

    let last = handle.last_schedule_run().await.unwrap().unwrap();
    assert_eq!(last.status, RunStatus::Done);

    let all = handle
        .schedule_runs_between(before, Utc::now())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].run_id < w[1].run_id));

    let by_id = handle.instance(all[0].run_id).await.unwrap().unwrap();
    assert_eq!(by_id.run_id, all[0].run_id);
    assert!(handle.instance(9_999).await.unwrap().is_none());
}

#[tokio::test]
async fn retention_runs_after_every_execution() {
    let repo = Arc::new(InMemoryRepository::new());
    let registry = test_mode_registry(&repo);
    let policy = clustercron::RetentionPolicy::builder().max_runs(2).build();
    let handle = registry
        .register(
            TaskConfig::builder()
                .name("chatty")
                .cron_expression("0 */5 * * * *")
                .retention_policy(policy)
                .build(),
            |ctx: RunContext| async move {
                ctx.log("working").await?;
                ctx.done("ok").await
            },
        )
        .await
        .unwrap();

    for _ in 0..5 {
        handle.run_now().await.unwrap();
    }

    assert_eq!(repo.count_runs_for_schedule("chatty").await.unwrap(), 2);
    // The survivors are the most recent runs, and their logs are intact.
    let last = handle.last_schedule_run().await.unwrap().unwrap();
    assert!(!repo.get_log_entries(last.run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn previous_run_is_visible_to_the_callback() {
    let repo = Arc::new(InMemoryRepository::new());
    let registry = test_mode_registry(&repo);

    let seen: Arc<Mutex<Vec<Option<i64>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_cb = seen.clone();
    let handle = registry
        .register(TaskConfig::new("chain", "0 */5 * * * *"), move |ctx: RunContext| {
            let seen = seen_in_cb.clone();
            async move {
                seen.lock()
                    .unwrap()
                    .push(ctx.previous_run().map(|run| run.run_id));
                ctx.done("ok").await
            }
        })
        .await
        .unwrap();

    handle.run_now().await.unwrap();
    handle.run_now().await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen[0], None);
    assert!(seen[1].is_some());
}
