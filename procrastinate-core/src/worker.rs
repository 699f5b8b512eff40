use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{StoreError, WorkerError};
use crate::store::JobStore;
use crate::task::{JobContext, Task, TaskError, TaskRegistry};
use crate::types::{DoneStatus, Job};

// Consecutive store failures a sub-worker tolerates (with backoff between
// them) before the whole worker stops.
const MAX_CONSECUTIVE_STORE_ERRORS: u32 = 5;
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The worker runtime: `concurrency` sub-workers sharing one store, each
/// with at most one job in flight. Per-job problems (handler errors, unknown
/// tasks, lost claims) never stop it; it stops when told to, or when the
/// database stays unreachable past the error budget.
pub struct Worker {
    store: JobStore,
    registry: Arc<TaskRegistry>,
    config: WorkerConfig,
    notifications: Option<watch::Receiver<u64>>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(store: JobStore, registry: TaskRegistry, config: WorkerConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
            notifications: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire in the wake channel from
    /// [`Connector::start_listener`](crate::Connector::start_listener).
    /// Without it the worker is poll-only, which is correct, just slower to
    /// pick up fresh work.
    pub fn with_notifications(mut self, notifications: watch::Receiver<u64>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Handle for stopping the worker. Cancelling it stops all fetching;
    /// in-flight jobs get `shutdown_graceful_timeout` to finish before
    /// cancellation reaches their handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<(), WorkerError> {
        let abort = CancellationToken::new();
        let shared = Arc::new(SubWorkerShared {
            store: self.store,
            registry: self.registry,
            worker_id: self.config.worker_id.clone(),
            queues: self.config.queues.clone(),
            polling_interval: self.config.polling_interval,
            abort: abort.clone(),
        });

        info!(
            worker_id = %shared.worker_id,
            concurrency = self.config.concurrency.max(1),
            queues = ?shared.queues,
            "worker started"
        );

        let mut sub_workers = JoinSet::new();
        for sub_worker_id in 0..self.config.concurrency.max(1) {
            sub_workers.spawn(sub_worker_loop(
                shared.clone(),
                sub_worker_id,
                self.notifications.clone(),
                self.shutdown.clone(),
            ));
        }

        let shutdown = self.shutdown;
        let drain = drain_sub_workers(sub_workers, &shutdown);
        tokio::pin!(drain);

        let result = tokio::select! {
            result = &mut drain => result,
            _ = shutdown.cancelled() => {
                info!(
                    timeout = ?self.config.shutdown_graceful_timeout,
                    "stopping, waiting for in-flight jobs"
                );
                match tokio::time::timeout(self.config.shutdown_graceful_timeout, &mut drain).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("grace period expired, cancelling in-flight jobs");
                        abort.cancel();
                        drain.await
                    }
                }
            }
        };

        info!(worker_id = %shared.worker_id, "worker stopped");
        result
    }
}

// Awaits every sub-worker. A fatal error in one cancels the rest; the first
// error wins.
async fn drain_sub_workers(
    mut sub_workers: JoinSet<Result<(), WorkerError>>,
    shutdown: &CancellationToken,
) -> Result<(), WorkerError> {
    let mut result = Ok(());
    while let Some(joined) = sub_workers.join_next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => error,
            Err(join_error) => {
                error!(%join_error, "sub-worker crashed");
                WorkerError::SubWorkerPanic
            }
        };
        error!(error = %failure, "sub-worker failed, stopping worker");
        if result.is_ok() {
            result = Err(failure);
        }
        shutdown.cancel();
    }
    result
}

struct SubWorkerShared {
    store: JobStore,
    registry: Arc<TaskRegistry>,
    worker_id: String,
    queues: Option<Vec<String>>,
    polling_interval: Duration,
    abort: CancellationToken,
}

async fn sub_worker_loop(
    shared: Arc<SubWorkerShared>,
    sub_worker_id: usize,
    mut notifications: Option<watch::Receiver<u64>>,
    stop_fetching: CancellationToken,
) -> Result<(), WorkerError> {
    let mut consecutive_errors: u32 = 0;

    loop {
        if stop_fetching.is_cancelled() {
            debug!(sub_worker_id, "sub-worker stopping");
            return Ok(());
        }

        match shared.store.fetch_one(shared.queues.as_deref()).await {
            Ok(Some(job)) => {
                consecutive_errors = 0;
                if let Err(error) = process_job(&shared, sub_worker_id, job).await {
                    consecutive_errors += 1;
                    warn!(sub_worker_id, %error, "failed to report job outcome");
                    if consecutive_errors >= MAX_CONSECUTIVE_STORE_ERRORS {
                        return Err(error.into());
                    }
                    error_backoff(consecutive_errors, &stop_fetching).await;
                }
            }
            Ok(None) => {
                consecutive_errors = 0;
                wait_for_work(
                    &mut notifications,
                    shared.polling_interval,
                    &stop_fetching,
                )
                .await;
            }
            Err(error) => {
                consecutive_errors += 1;
                warn!(sub_worker_id, %error, "failed to fetch a job");
                if consecutive_errors >= MAX_CONSECUTIVE_STORE_ERRORS {
                    error!(sub_worker_id, "store error budget exhausted");
                    return Err(error.into());
                }
                error_backoff(consecutive_errors, &stop_fetching).await;
            }
        }
    }
}

/// Idle wait: a NOTIFY wake-up, the polling timer, or shutdown, whichever
/// comes first. Notifications are advisory; the timer alone is already
/// correct.
async fn wait_for_work(
    notifications: &mut Option<watch::Receiver<u64>>,
    polling_interval: Duration,
    stop_fetching: &CancellationToken,
) {
    match notifications {
        Some(receiver) => {
            tokio::select! {
                _ = stop_fetching.cancelled() => {}
                changed = receiver.changed() => {
                    if changed.is_err() {
                        // Listener is gone for good; stay on pure polling.
                        warn!("notification channel closed, falling back to polling");
                        *notifications = None;
                    }
                }
                _ = tokio::time::sleep(polling_interval) => {}
            }
        }
        None => {
            tokio::select! {
                _ = stop_fetching.cancelled() => {}
                _ = tokio::time::sleep(polling_interval) => {}
            }
        }
    }
}

async fn error_backoff(consecutive_errors: u32, stop_fetching: &CancellationToken) {
    let delay = STORE_ERROR_BACKOFF * consecutive_errors;
    tokio::select! {
        _ = stop_fetching.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

/// Executes one claimed job and reports its outcome. Errors returned here
/// are store errors only; everything the handler does (including panicking)
/// is converted into a job outcome.
async fn process_job(
    shared: &Arc<SubWorkerShared>,
    sub_worker_id: usize,
    job: Job,
) -> Result<(), StoreError> {
    let job_id = job.id;

    let Some(task) = shared.registry.get(&job.task_name) else {
        let error = WorkerError::TaskNotFound {
            task_name: job.task_name.clone(),
        };
        error!(job_id, %error, "failing job");
        return swallow_lost_claim(
            shared.store.finish(job_id, DoneStatus::Failed).await,
            job_id,
        );
    };
    let task = task.clone();

    // The row still shows the pre-execution count; this run is attempt N+1,
    // which is what the row will say once the outcome lands.
    let attempts = job.attempts + 1;
    let args = job.args.0.clone();
    let job = Arc::new(job);
    let context = task.pass_context().then(|| JobContext {
        job: job.clone(),
        worker_id: shared.worker_id.clone(),
        store: shared.store.clone(),
        abort: shared.abort.clone(),
    });

    debug!(job_id, task = task.name(), sub_worker_id, "executing job");
    let started = Instant::now();
    let outcome = AssertUnwindSafe(task.handler().run(args, context))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(TaskError::failure(anyhow::anyhow!(
                "task handler panicked"
            )))
        });
    let elapsed = started.elapsed();

    match outcome {
        Ok(()) => {
            info!(job_id, task = task.name(), ?elapsed, "job succeeded");
            swallow_lost_claim(
                shared.store.finish(job_id, DoneStatus::Succeeded).await,
                job_id,
            )
        }
        Err(TaskError::Aborted) => {
            warn!(job_id, task = task.name(), "job aborted");
            swallow_lost_claim(
                shared.store.finish(job_id, DoneStatus::Failed).await,
                job_id,
            )
        }
        Err(error) => report_failure(shared, &task, job_id, attempts, error).await,
    }
}

async fn report_failure(
    shared: &Arc<SubWorkerShared>,
    task: &Task,
    job_id: i64,
    attempts: i32,
    error: TaskError,
) -> Result<(), StoreError> {
    match task.retry_policy().retry_at(attempts, &error) {
        Some(retry_at) => {
            warn!(
                job_id,
                task = task.name(),
                %error,
                attempts,
                %retry_at,
                "job failed, will retry"
            );
            swallow_lost_claim(shared.store.retry(job_id, retry_at).await, job_id)
        }
        None => {
            error!(
                job_id,
                task = task.name(),
                %error,
                attempts,
                "job failed permanently"
            );
            swallow_lost_claim(
                shared.store.finish(job_id, DoneStatus::Failed).await,
                job_id,
            )
        }
    }
}

// A finish that finds the row no longer in `doing` means the janitor reaped
// the job out from under us (or we double-reported). The work may run
// again; that is the at-least-once contract, not a worker failure.
fn swallow_lost_claim(result: Result<(), StoreError>, job_id: i64) -> Result<(), StoreError> {
    match result {
        Err(StoreError::UnexpectedJobStatus { .. }) => {
            warn!(job_id, "job was no longer ours to report, dropping the update");
            Ok(())
        }
        other => other,
    }
}
