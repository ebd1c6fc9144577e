//! Task and registry configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// How severe an outage of this task is for the business.
///
/// Diagnostic metadata only; the engine schedules all tasks the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Criticality {
    MissionCritical,
    Vital,
    #[default]
    Important,
    Minor,
}

/// Whether a failed run fixes itself on the next cycle or needs an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Recovery {
    SelfHealing,
    #[default]
    ManualIntervention,
}

/// Retention rules applied to a task's run history after every run.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RetentionPolicy {
    /// Runs older than this are deleted.
    #[builder(default = Duration::days(90))]
    pub max_age: Duration,
    /// At most this many runs are kept per task, newest first.
    #[builder(default = 1_000)]
    pub max_runs: i64,
    /// Whether log entries are deleted along with their runs.
    #[builder(default = true)]
    pub delete_logs: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Immutable per-task configuration supplied at registration.
#[derive(Debug, Clone, TypedBuilder)]
pub struct TaskConfig {
    #[builder(setter(into))]
    pub name: String,
    /// Default cron expression; may be overridden at runtime per task.
    #[builder(setter(into))]
    pub cron_expression: String,
    /// Expected upper bound on run time. Zero means no expectation; a run
    /// exceeding it is reported as overdue but never interrupted.
    #[builder(default = 0)]
    pub max_expected_minutes_to_run: i64,
    #[builder(default)]
    pub criticality: Criticality,
    #[builder(default)]
    pub recovery: Recovery,
    #[builder(default)]
    pub retention_policy: RetentionPolicy,
}

impl TaskConfig {
    /// Config with defaults for everything but name and cron.
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self::builder()
            .name(name)
            .cron_expression(cron_expression)
            .build()
    }
}

/// Process-wide registry configuration.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RegistryConfig {
    /// Identity recorded on lock rows and runs. Defaults to the DNS hostname.
    #[builder(default = default_node_name(), setter(into))]
    pub node_name: String,
    /// Name of the cluster-wide lock row.
    #[builder(default = "scheduledtask".to_string(), setter(into))]
    pub lock_name: String,
    /// In test mode no background loops are spawned and `run_now` executes
    /// the callback inline on the caller's task.
    #[builder(default = false)]
    pub test_mode: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RegistryConfig {
    pub fn for_tests() -> Self {
        Self::builder().test_mode(true).build()
    }
}

/// Local host identifier used on lock rows and run records.
pub(crate) fn default_node_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
