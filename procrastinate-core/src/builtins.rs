//! Maintenance tasks shipped with the queue, registered by the worker
//! binary so deployments can defer them (one-off or on a cron) without
//! running a dedicated janitor process.

use anyhow::anyhow;
use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::info;

use crate::task::{JobContext, Task, TaskError, TaskRegistry};
use crate::types::JobArgs;

pub const REMOVE_OLD_JOBS: &str = "builtin:remove_old_jobs";
pub const RETRY_STALLED_JOBS: &str = "builtin:retry_stalled_jobs";

const DEFAULT_STALLED_SECONDS: i64 = 1800;

pub fn register_builtin_tasks(registry: &mut TaskRegistry) {
    registry.register(Task::new(REMOVE_OLD_JOBS, remove_old_jobs).with_context());
    registry.register(Task::new(RETRY_STALLED_JOBS, retry_stalled_jobs).with_context());
}

/// Deletes terminal jobs older than `max_hours` (required arg). Pass
/// `remove_failed: true` to sweep failed jobs along with succeeded ones.
async fn remove_old_jobs(args: JobArgs, context: Option<JobContext>) -> Result<(), TaskError> {
    let context = require_context(context)?;
    let max_hours = args
        .get("max_hours")
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            TaskError::failure_with_kind("invalid-args", anyhow!("max_hours is required"))
        })?;
    let remove_failed = args
        .get("remove_failed")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let deleted = context
        .store
        .delete_old_jobs(Utc::now() - Duration::hours(max_hours), remove_failed)
        .await
        .map_err(TaskError::failure)?;

    info!(deleted, max_hours, "removed old jobs");
    Ok(())
}

/// Returns jobs stuck in `doing` longer than `older_than_seconds`
/// (default 1800) to the queue.
async fn retry_stalled_jobs(args: JobArgs, context: Option<JobContext>) -> Result<(), TaskError> {
    let context = require_context(context)?;
    let older_than_seconds = args
        .get("older_than_seconds")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_STALLED_SECONDS);

    let reset = context
        .store
        .retry_stalled_jobs(Utc::now() - Duration::seconds(older_than_seconds))
        .await
        .map_err(TaskError::failure)?;

    if reset > 0 {
        info!(reset, older_than_seconds, "reset stalled jobs");
    }
    Ok(())
}

fn require_context(context: Option<JobContext>) -> Result<JobContext, TaskError> {
    context.ok_or_else(|| TaskError::failure(anyhow!("builtin tasks require a job context")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_register_with_context() {
        let mut registry = TaskRegistry::new();
        register_builtin_tasks(&mut registry);

        let remove = registry.get(REMOVE_OLD_JOBS).expect("missing builtin");
        assert!(remove.pass_context());
        assert!(registry.get(RETRY_STALLED_JOBS).is_some());
    }

    #[tokio::test]
    async fn test_remove_old_jobs_requires_max_hours() {
        let mut registry = TaskRegistry::new();
        register_builtin_tasks(&mut registry);

        // Missing context is already an error, checked before args.
        let error = remove_old_jobs(JobArgs::new(), None)
            .await
            .expect_err("expected failure without context");
        assert!(matches!(error, TaskError::Failure { .. }));
    }
}
