use std::time::Duration;

use procrastinate_core::{DeferredJob, Job, JobArgs, JobFilter, JobStatus, JobStore};
use serde_json::Value;

#[allow(dead_code)]
pub fn job_args(pairs: &[(&str, Value)]) -> JobArgs {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), value.clone()))
        .collect()
}

#[allow(dead_code)]
pub fn simple_job(task_name: &str) -> DeferredJob {
    DeferredJob::new("default", task_name)
}

#[allow(dead_code)]
pub async fn get_job(store: &JobStore, job_id: i64) -> Job {
    store
        .list_jobs(&JobFilter {
            id: Some(job_id),
            ..Default::default()
        })
        .await
        .expect("failed to list jobs")
        .pop()
        .expect("job not found")
}

#[allow(dead_code)]
pub async fn event_types(store: &JobStore, job_id: i64) -> Vec<String> {
    store
        .list_events(job_id)
        .await
        .expect("failed to list events")
        .into_iter()
        .map(|event| event.event_type)
        .collect()
}

/// Polls until the job reaches the wanted status, panicking after the
/// deadline. Worker tests are asynchronous end to end, so everything is
/// observed through the table.
#[allow(dead_code)]
pub async fn wait_for_status(store: &JobStore, job_id: i64, status: JobStatus, deadline: Duration) {
    let started = std::time::Instant::now();
    loop {
        let job = get_job(store, job_id).await;
        if job.status == status {
            return;
        }
        assert!(
            started.elapsed() < deadline,
            "job {job_id} did not reach {status} within {deadline:?}, still {}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
