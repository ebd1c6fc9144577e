use thiserror::Error;

/// Errors surfaced by the scheduling engine's public API.
///
/// Nothing in this taxonomy escapes a runner loop: repository and callback
/// failures inside the loops are logged and retried. These variants surface
/// synchronously to callers of the embedding API.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// An operator supplied a cron expression that does not parse. Never
    /// stored; surfaced to the caller of `set_override_expression` or
    /// `register`.
    #[error("invalid cron expression '{expression}': {message}")]
    CronParse { expression: String, message: String },

    #[error("task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("task '{0}' is not registered")]
    UnknownTask(String),

    #[error("repository error: {0}")]
    Repository(#[from] anyhow::Error),
}
