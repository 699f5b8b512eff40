use crate::error::StoreError;
use crate::types::DeferredJob;

/// Name of the partial unique index guarding queueing locks; violations of
/// it are the one database error the store interprets.
const QUEUEING_LOCK_INDEX: &str = "procrastinate_jobs_queueing_lock_idx";

/// Inserts one `todo` row and returns its id. The queueing-lock admission
/// check happens inside the same statement, via the partial unique index:
/// a conflicting live job makes the insert fail, which we surface as
/// [`StoreError::AlreadyEnqueued`].
pub async fn defer_job<'c, E>(executor: E, job: &DeferredJob) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_scalar("SELECT procrastinate_defer_job($1, $2, $3, $4, $5, $6)")
        .bind(&job.queue_name)
        .bind(&job.task_name)
        .bind(&job.lock)
        .bind(&job.queueing_lock)
        .bind(sqlx::types::Json(&job.args))
        .bind(job.scheduled_at)
        .fetch_one(executor)
        .await
        .map_err(|error| map_defer_error(error, job.queueing_lock.as_deref()))
}

fn map_defer_error(error: sqlx::Error, queueing_lock: Option<&str>) -> StoreError {
    if let sqlx::Error::Database(database_error) = &error {
        if database_error.constraint() == Some(QUEUEING_LOCK_INDEX) {
            return StoreError::AlreadyEnqueued {
                queueing_lock: queueing_lock.unwrap_or_default().to_owned(),
            };
        }
    }
    StoreError::Query {
        command: "defer_job",
        error,
    }
}
