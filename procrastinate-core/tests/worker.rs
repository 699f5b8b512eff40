use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::anyhow;
use chrono::{Duration, Utc};
use common::{get_job, simple_job, wait_for_status};
use procrastinate_core::{
    Backoff, Connector, JobArgs, JobContext, JobStatus, JobStore, RetryPolicy, Task, TaskError,
    TaskRegistry, Worker, WorkerConfig, ANY_QUEUE_CHANNEL,
};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

mod common;

const DEADLINE: StdDuration = StdDuration::from_secs(15);

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 2,
        polling_interval: StdDuration::from_millis(100),
        shutdown_graceful_timeout: StdDuration::from_secs(5),
        ..Default::default()
    }
}

fn counting_task(name: &str, counter: Arc<AtomicU32>) -> Task {
    Task::new(name, move |_args: JobArgs, _context: Option<JobContext>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), TaskError>(())
        }
    })
}

async fn always_failing(
    _args: JobArgs,
    _context: Option<JobContext>,
) -> Result<(), TaskError> {
    Err(TaskError::failure(anyhow!("always broken")))
}

async fn aborting(_args: JobArgs, _context: Option<JobContext>) -> Result<(), TaskError> {
    Err(TaskError::Aborted)
}

async fn panicking(_args: JobArgs, _context: Option<JobContext>) -> Result<(), TaskError> {
    panic!("handler bug")
}

// Cooperative cancellation: hold the job until the worker's grace period
// expires, then hand it back to the queue.
async fn wait_for_abort(
    _args: JobArgs,
    context: Option<JobContext>,
) -> Result<(), TaskError> {
    let context = context.expect("task registered with context");
    context.abort.cancelled().await;
    Err(TaskError::retry_at(Utc::now()))
}

#[sqlx::test(migrations = "./migrations")]
async fn test_worker_executes_deferred_jobs(db: PgPool) {
    let store = JobStore::from_pool(db);
    let counter = Arc::new(AtomicU32::new(0));

    let mut registry = TaskRegistry::new();
    registry.register(counting_task("count", counter.clone()));

    let mut job_ids = Vec::new();
    for _ in 0..5 {
        job_ids.push(store.defer(&simple_job("count")).await.expect("failed to defer"));
    }

    let worker = Worker::new(store.clone(), registry, fast_worker_config());
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    for job_id in &job_ids {
        wait_for_status(&store, *job_id, JobStatus::Succeeded, DEADLINE).await;
    }

    shutdown.cancel();
    handle
        .await
        .expect("worker task panicked")
        .expect("worker failed");

    assert_eq!(counter.load(Ordering::SeqCst), 5);
    for job_id in job_ids {
        assert_eq!(get_job(&store, job_id).await.attempts, 1);
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn test_worker_fails_unknown_tasks(db: PgPool) {
    let store = JobStore::from_pool(db);
    let registry = TaskRegistry::new();

    let job_id = store
        .defer(&simple_job("renamed.task"))
        .await
        .expect("failed to defer");

    let worker = Worker::new(store.clone(), registry, fast_worker_config());
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    wait_for_status(&store, job_id, JobStatus::Failed, DEADLINE).await;
    assert_eq!(get_job(&store, job_id).await.attempts, 1);

    shutdown.cancel();
    handle
        .await
        .expect("worker task panicked")
        .expect("worker failed");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_worker_retries_until_success(db: PgPool) {
    let store = JobStore::from_pool(db);
    let attempts_seen = Arc::new(AtomicU32::new(0));

    let handler_attempts = attempts_seen.clone();
    let mut registry = TaskRegistry::new();
    registry.register(
        Task::new("flaky", move |_args: JobArgs, _context: Option<JobContext>| {
            let attempts = handler_attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskError::failure(anyhow!("not yet")))
                } else {
                    Ok(())
                }
            }
        })
        .with_retry_policy(
            RetryPolicy::build(5, Duration::zero())
                .backoff(Backoff::Fixed)
                .provide(),
        ),
    );

    let job_id = store.defer(&simple_job("flaky")).await.expect("failed to defer");

    let worker = Worker::new(store.clone(), registry, fast_worker_config());
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    wait_for_status(&store, job_id, JobStatus::Succeeded, DEADLINE).await;
    assert_eq!(get_job(&store, job_id).await.attempts, 3);
    assert_eq!(attempts_seen.load(Ordering::SeqCst), 3);

    shutdown.cancel();
    handle
        .await
        .expect("worker task panicked")
        .expect("worker failed");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_worker_exhausts_retry_policy(db: PgPool) {
    let store = JobStore::from_pool(db);

    let mut registry = TaskRegistry::new();
    registry.register(
        Task::new("doomed", always_failing).with_retry_policy(
            RetryPolicy::build(2, Duration::zero())
                .backoff(Backoff::Fixed)
                .provide(),
        ),
    );

    let job_id = store.defer(&simple_job("doomed")).await.expect("failed to defer");

    let worker = Worker::new(store.clone(), registry, fast_worker_config());
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    wait_for_status(&store, job_id, JobStatus::Failed, DEADLINE).await;
    assert_eq!(get_job(&store, job_id).await.attempts, 2);

    shutdown.cancel();
    handle
        .await
        .expect("worker task panicked")
        .expect("worker failed");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_aborting_task_fails_without_retry(db: PgPool) {
    let store = JobStore::from_pool(db);

    let mut registry = TaskRegistry::new();
    registry.register(
        Task::new("quitter", aborting)
            // A generous policy that must not matter: aborts are final.
            .with_retry_policy(RetryPolicy::build(10, Duration::zero()).provide()),
    );

    let job_id = store.defer(&simple_job("quitter")).await.expect("failed to defer");

    let worker = Worker::new(store.clone(), registry, fast_worker_config());
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    wait_for_status(&store, job_id, JobStatus::Failed, DEADLINE).await;
    assert_eq!(get_job(&store, job_id).await.attempts, 1);

    shutdown.cancel();
    handle
        .await
        .expect("worker task panicked")
        .expect("worker failed");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_panicking_handler_fails_the_job_not_the_worker(db: PgPool) {
    let store = JobStore::from_pool(db);
    let counter = Arc::new(AtomicU32::new(0));

    let mut registry = TaskRegistry::new();
    registry.register(Task::new("buggy", panicking));
    registry.register(counting_task("count", counter.clone()));

    let buggy_id = store.defer(&simple_job("buggy")).await.expect("failed to defer");
    let count_id = store.defer(&simple_job("count")).await.expect("failed to defer");

    let worker = Worker::new(store.clone(), registry, fast_worker_config());
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    wait_for_status(&store, buggy_id, JobStatus::Failed, DEADLINE).await;
    // The sub-worker survived the panic and kept serving the queue.
    wait_for_status(&store, count_id, JobStatus::Succeeded, DEADLINE).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    handle
        .await
        .expect("worker task panicked")
        .expect("worker failed");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_graceful_shutdown_requeues_cancelled_jobs(db: PgPool) {
    let store = JobStore::from_pool(db);

    let mut registry = TaskRegistry::new();
    registry.register(Task::new("slow", wait_for_abort).with_context());

    let job_id = store.defer(&simple_job("slow")).await.expect("failed to defer");

    let config = WorkerConfig {
        concurrency: 1,
        polling_interval: StdDuration::from_millis(100),
        shutdown_graceful_timeout: StdDuration::from_millis(200),
        ..Default::default()
    };
    let worker = Worker::new(store.clone(), registry, config);
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    wait_for_status(&store, job_id, JobStatus::Doing, DEADLINE).await;

    shutdown.cancel();
    handle
        .await
        .expect("worker task panicked")
        .expect("worker failed");

    // The handler honored cancellation by requeueing, so the job is back
    // where the next worker will pick it up.
    let job = get_job(&store, job_id).await;
    assert_eq!(job.status, JobStatus::Todo);
    assert_eq!(job.attempts, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_notify_wakes_idle_worker(db: PgPool) {
    let store = JobStore::from_pool(db.clone());
    let counter = Arc::new(AtomicU32::new(0));

    let mut registry = TaskRegistry::new();
    registry.register(counting_task("count", counter.clone()));

    // Polling alone would take half a minute; completion within the
    // deadline means the NOTIFY wake-up worked.
    let config = WorkerConfig {
        concurrency: 1,
        polling_interval: StdDuration::from_secs(30),
        shutdown_graceful_timeout: StdDuration::from_secs(5),
        ..Default::default()
    };

    let connector = Connector::from_pool(db);
    let listener_shutdown = CancellationToken::new();
    let hub = connector.start_listener(
        vec![ANY_QUEUE_CHANNEL.to_owned()],
        listener_shutdown.clone(),
    );

    let worker = Worker::new(store.clone(), registry, config).with_notifications(hub.subscribe());
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    // Let the worker finish its first empty fetch and go idle.
    tokio::time::sleep(StdDuration::from_millis(500)).await;

    let job_id = store.defer(&simple_job("count")).await.expect("failed to defer");
    wait_for_status(&store, job_id, JobStatus::Succeeded, StdDuration::from_secs(10)).await;

    shutdown.cancel();
    listener_shutdown.cancel();
    handle
        .await
        .expect("worker task panicked")
        .expect("worker failed");
}
