use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::periodic::PeriodicSchedule;
use crate::retry::RetryPolicy;
use crate::store::JobStore;
use crate::types::{Job, JobArgs};

pub const DEFAULT_QUEUE: &str = "default";

/// What a handler reports back. `Ok(())` finishes the job as succeeded;
/// everything else goes through here.
#[derive(Error, Debug)]
pub enum TaskError {
    /// The handler wants another attempt, optionally at a specific time.
    /// Bypasses the policy's attempt limit: the task asked explicitly.
    #[error("task requested a retry")]
    Retry { at: Option<DateTime<Utc>> },
    /// The handler observed cancellation and gave up for good. Fails the
    /// job immediately, no policy consult.
    #[error("task aborted")]
    Aborted,
    /// Anything else. The task's retry policy decides what happens next,
    /// optionally keying off `kind`.
    #[error("task failed: {error}")]
    Failure {
        kind: Option<String>,
        #[source]
        error: anyhow::Error,
    },
}

impl TaskError {
    pub fn retry() -> Self {
        TaskError::Retry { at: None }
    }

    pub fn retry_at(at: DateTime<Utc>) -> Self {
        TaskError::Retry { at: Some(at) }
    }

    pub fn failure(error: impl Into<anyhow::Error>) -> Self {
        TaskError::Failure {
            kind: None,
            error: error.into(),
        }
    }

    pub fn failure_with_kind(kind: &str, error: impl Into<anyhow::Error>) -> Self {
        TaskError::Failure {
            kind: Some(kind.to_owned()),
            error: error.into(),
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        TaskError::failure(error)
    }
}

/// Handed to handlers whose task opted in via [`Task::with_context`].
#[derive(Clone)]
pub struct JobContext {
    /// The row being executed, as fetched.
    pub job: Arc<Job>,
    pub worker_id: String,
    /// Lets handlers defer follow-up work on the same queue cluster.
    pub store: JobStore,
    /// Cancelled when the shutdown grace period expires. Handlers that
    /// honor it should return [`TaskError::retry_at`] with `now` so the job
    /// goes back to the queue, or [`TaskError::Aborted`] to drop it.
    pub abort: CancellationToken,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, args: JobArgs, context: Option<JobContext>) -> Result<(), TaskError>;
}

/// Plain async functions and closures are handlers too.
#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(JobArgs, Option<JobContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn run(&self, args: JobArgs, context: Option<JobContext>) -> Result<(), TaskError> {
        (self)(args, context).await
    }
}

/// A named unit of work the worker knows how to execute.
#[derive(Clone)]
pub struct Task {
    name: String,
    queue_name: String,
    handler: Arc<dyn TaskHandler>,
    retry_policy: RetryPolicy,
    pass_context: bool,
    periodic: Option<PeriodicSchedule>,
}

impl Task {
    pub fn new(name: &str, handler: impl TaskHandler + 'static) -> Self {
        Self {
            name: name.to_owned(),
            queue_name: DEFAULT_QUEUE.to_owned(),
            handler: Arc::new(handler),
            retry_policy: RetryPolicy::default(),
            pass_context: false,
            periodic: None,
        }
    }

    /// Default queue for defers that don't name one (periodic defers always
    /// use it).
    pub fn on_queue(mut self, queue_name: &str) -> Self {
        self.queue_name = queue_name.to_owned();
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Hand the handler a [`JobContext`] on every run.
    pub fn with_context(mut self) -> Self {
        self.pass_context = true;
        self
    }

    pub fn with_periodic(mut self, schedule: PeriodicSchedule) -> Self {
        self.periodic = Some(schedule);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn handler(&self) -> &Arc<dyn TaskHandler> {
        &self.handler
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn pass_context(&self) -> bool {
        self.pass_context
    }

    pub fn periodic(&self) -> Option<&PeriodicSchedule> {
        self.periodic.as_ref()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("queue_name", &self.queue_name)
            .field("pass_context", &self.pass_context)
            .field("periodic", &self.periodic.as_ref().map(|p| p.expression()))
            .finish_non_exhaustive()
    }
}

/// All tasks a worker process can execute, built once at startup and
/// immutable afterwards; readers never need locking.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task under its name, returning the task it displaced if
    /// the name was already taken.
    pub fn register(&mut self, task: Task) -> Option<Arc<Task>> {
        self.tasks.insert(task.name.clone(), Arc::new(task))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Task>> {
        self.tasks.get(name)
    }

    pub fn periodic_tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.values().filter(|task| task.periodic.is_some())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_args: JobArgs, _context: Option<JobContext>) -> Result<(), TaskError> {
        Ok(())
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TaskRegistry::new();
        registry.register(Task::new("email.send", noop));

        assert!(registry.get("email.send").is_some());
        assert!(registry.get("email.receive").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_displaces_same_name() {
        let mut registry = TaskRegistry::new();
        assert!(registry.register(Task::new("t", noop)).is_none());
        assert!(registry.register(Task::new("t", noop)).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_periodic_tasks_are_filtered() {
        let mut registry = TaskRegistry::new();
        registry.register(Task::new("plain", noop));
        registry.register(
            Task::new("cleanup", noop).with_periodic(
                PeriodicSchedule::parse("*/5 * * * *").expect("failed to parse cron expression"),
            ),
        );

        let periodic: Vec<_> = registry.periodic_tasks().collect();
        assert_eq!(periodic.len(), 1);
        assert_eq!(periodic[0].name(), "cleanup");
    }

    #[test]
    fn test_failure_kind_tagging() {
        let error = TaskError::failure_with_kind("io", anyhow::anyhow!("reset"));
        assert!(matches!(
            error,
            TaskError::Failure { kind: Some(ref k), .. } if k == "io"
        ));
    }
}
