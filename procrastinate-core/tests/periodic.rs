use std::time::Duration as StdDuration;

use chrono::{TimeZone, Utc};
use common::job_args;
use procrastinate_core::{
    JobFilter, JobStatus, JobStore, PeriodicDeferrer, PeriodicSchedule, Task, TaskError,
    TaskRegistry,
};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

mod common;

#[sqlx::test(migrations = "./migrations")]
async fn test_defer_periodic_is_idempotent_per_slot(db: PgPool) {
    let store = JobStore::from_pool(db);
    let slot = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap().timestamp();
    let args = job_args(&[("source", json!("cron"))]);

    let first = store
        .defer_periodic("default", "clean", slot, &args)
        .await
        .expect("failed to defer periodic job");
    let job_id = first.expect("first call should enqueue a job");

    // Every other deferrer in the cluster loses the race for this slot.
    for _ in 0..4 {
        let duplicate = store
            .defer_periodic("default", "clean", slot, &args)
            .await
            .expect("failed to defer periodic job");
        assert_eq!(duplicate, None);
    }

    let jobs = store
        .list_jobs(&JobFilter {
            task_name: Some("clean".to_owned()),
            ..Default::default()
        })
        .await
        .expect("failed to list jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job_id);
    assert_eq!(jobs[0].status, JobStatus::Todo);
    assert_eq!(jobs[0].args.0.get("source"), Some(&json!("cron")));
}

#[sqlx::test(migrations = "./migrations")]
async fn test_defer_periodic_new_slot_enqueues_again(db: PgPool) {
    let store = JobStore::from_pool(db);
    let first_slot = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap().timestamp();
    let second_slot = Utc.with_ymd_and_hms(2024, 6, 1, 12, 5, 0).unwrap().timestamp();
    let args = job_args(&[]);

    store
        .defer_periodic("default", "clean", first_slot, &args)
        .await
        .expect("failed to defer")
        .expect("first slot should enqueue");
    store
        .defer_periodic("default", "clean", second_slot, &args)
        .await
        .expect("failed to defer")
        .expect("new slot should enqueue");

    let jobs = store
        .list_jobs(&JobFilter {
            task_name: Some("clean".to_owned()),
            ..Default::default()
        })
        .await
        .expect("failed to list jobs");
    assert_eq!(jobs.len(), 2);
}

async fn noop(
    _args: procrastinate_core::JobArgs,
    _context: Option<procrastinate_core::JobContext>,
) -> Result<(), TaskError> {
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_deferrer_enqueues_at_boundaries(db: PgPool) {
    let store = JobStore::from_pool(db);

    let mut registry = TaskRegistry::new();
    registry.register(
        Task::new("tick", noop).with_periodic(
            // Every second, so the test observes a boundary quickly.
            PeriodicSchedule::parse("* * * * * *").expect("failed to parse cron expression"),
        ),
    );

    let shutdown = CancellationToken::new();
    let deferrer = PeriodicDeferrer::new(
        store.clone(),
        &registry,
        chrono_tz::Tz::UTC,
        shutdown.clone(),
    );
    let handle = tokio::spawn(deferrer.run());

    tokio::time::sleep(StdDuration::from_millis(2500)).await;
    shutdown.cancel();
    handle.await.expect("deferrer task panicked");

    let jobs = store
        .list_jobs(&JobFilter {
            task_name: Some("tick".to_owned()),
            ..Default::default()
        })
        .await
        .expect("failed to list jobs");
    assert!(
        !jobs.is_empty(),
        "at least one boundary should have been deferred"
    );
}
