use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

use crate::error::StoreError;
use crate::types::{Job, JobEvent, JobFilter};

const JOB_COLUMNS: &str =
    "id, queue_name, task_name, lock, queueing_lock, args, status, scheduled_at, attempts";

pub async fn list_jobs<'c, E>(executor: E, filter: &JobFilter) -> Result<Vec<Job>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let mut query = QueryBuilder::new(format!(
        "SELECT {JOB_COLUMNS} FROM procrastinate_jobs WHERE TRUE"
    ));
    if let Some(id) = filter.id {
        query.push(" AND id = ");
        query.push_bind(id);
    }
    if let Some(queue_name) = &filter.queue_name {
        query.push(" AND queue_name = ");
        query.push_bind(queue_name);
    }
    if let Some(task_name) = &filter.task_name {
        query.push(" AND task_name = ");
        query.push_bind(task_name);
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ");
        query.push_bind(status.as_str());
    }
    if let Some(lock) = &filter.lock {
        query.push(" AND lock = ");
        query.push_bind(lock);
    }
    if let Some(queueing_lock) = &filter.queueing_lock {
        query.push(" AND queueing_lock = ");
        query.push_bind(queueing_lock);
    }
    query.push(" ORDER BY id ASC");

    query
        .build_query_as::<Job>()
        .fetch_all(executor)
        .await
        .map_err(StoreError::query("list_jobs"))
}

pub async fn list_events<'c, E>(executor: E, job_id: i64) -> Result<Vec<JobEvent>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, JobEvent>(
        "SELECT id, job_id, type, at FROM procrastinate_events WHERE job_id = $1 ORDER BY id ASC",
    )
    .bind(job_id)
    .fetch_all(executor)
    .await
    .map_err(StoreError::query("list_events"))
}

/// Fails a `todo` job before any worker picks it up, recording a
/// `cancelled` event as the marker. Returns false without touching anything
/// for `doing` rows (stopping those is the owning worker's business) and
/// for rows already terminal.
pub async fn cancel_job<'c, E>(executor: E, job_id: i64) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        "WITH cancelled AS (
             UPDATE procrastinate_jobs
                 SET status = 'failed'
                 WHERE id = $1 AND status = 'todo'
                 RETURNING id
         )
         INSERT INTO procrastinate_events (job_id, type)
             SELECT id, 'cancelled' FROM cancelled",
    )
    .bind(job_id)
    .execute(executor)
    .await
    .map_err(StoreError::query("cancel_job"))?;

    Ok(result.rows_affected() > 0)
}

/// Deletes terminal jobs whose last recorded event is older than the
/// horizon. Events go with them via the cascade.
pub async fn delete_old_jobs<'c, E>(
    executor: E,
    finished_before: DateTime<Utc>,
    include_failed: bool,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let mut statuses = vec!["succeeded".to_owned()];
    if include_failed {
        statuses.push("failed".to_owned());
    }

    let result = sqlx::query(
        "DELETE FROM procrastinate_jobs
         WHERE status = ANY($1)
           AND id IN (
               SELECT job_id FROM procrastinate_events
                   GROUP BY job_id
                   HAVING max(at) < $2
           )",
    )
    .bind(statuses)
    .bind(finished_before)
    .execute(executor)
    .await
    .map_err(StoreError::query("delete_old_jobs"))?;

    Ok(result.rows_affected())
}

/// Returns `doing` jobs abandoned by a dead worker to `todo`. Staleness is
/// judged from the job's last `started` event, since the jobs table carries
/// no heartbeat. `attempts` is left untouched: the job never finished, so
/// no attempt completed.
pub async fn retry_stalled_jobs<'c, E>(
    executor: E,
    started_before: DateTime<Utc>,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        "WITH stalled AS (
             SELECT jobs.id
                 FROM procrastinate_jobs AS jobs
                 WHERE jobs.status = 'doing'
                   AND (SELECT max(at) FROM procrastinate_events
                            WHERE job_id = jobs.id AND type = 'started') < $1
                 FOR UPDATE OF jobs SKIP LOCKED
         ),
         reset AS (
             UPDATE procrastinate_jobs
                 SET status = 'todo'
                 FROM stalled
                 WHERE procrastinate_jobs.id = stalled.id
                 RETURNING procrastinate_jobs.id
         )
         INSERT INTO procrastinate_events (job_id, type)
             SELECT id, 'abandoned' FROM reset",
    )
    .bind(started_before)
    .execute(executor)
    .await
    .map_err(StoreError::query("retry_stalled_jobs"))?;

    Ok(result.rows_affected())
}

pub async fn check_connection<'c, E>(executor: E) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(executor)
        .await
        .map_err(StoreError::query("check_connection"))?;
    Ok(())
}

pub async fn schema_applied<'c, E>(executor: E) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_scalar::<_, bool>("SELECT to_regclass('procrastinate_jobs') IS NOT NULL")
        .fetch_one(executor)
        .await
        .map_err(StoreError::query("schema_applied"))
}
