use crate::error::StoreError;
use crate::types::JobArgs;

/// Defers a job for one periodic schedule slot. Returns the new job id, or
/// `None` when another deferrer already claimed the slot (the slot table has
/// one row per (task, timestamp) cluster-wide, so exactly one caller wins).
pub async fn defer_periodic_job<'c, E>(
    executor: E,
    queue_name: &str,
    task_name: &str,
    defer_timestamp: i64,
    args: &JobArgs,
) -> Result<Option<i64>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_scalar("SELECT procrastinate_defer_periodic_job($1, $2, $3, $4)")
        .bind(queue_name)
        .bind(task_name)
        .bind(defer_timestamp)
        .bind(sqlx::types::Json(args))
        .fetch_one(executor)
        .await
        .map_err(StoreError::query("defer_periodic_job"))
}
