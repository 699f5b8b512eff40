use crate::error::StoreError;
use crate::types::Job;

/// Claims the next ready job, moving it to `doing`, in a single round trip.
/// Returns `None` when nothing is eligible. `queues = None` serves every
/// queue. Jobs are claimed in `id` order; `scheduled_at` only gates
/// eligibility.
pub async fn fetch_job<'c, E>(executor: E, queues: Option<&[String]>) -> Result<Option<Job>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    // The function returns a composite; when no row qualifies, every column
    // of the composite comes back NULL, hence the id guard.
    sqlx::query_as::<_, Job>(
        "SELECT id, queue_name, task_name, lock, queueing_lock, args, status, scheduled_at, attempts \
         FROM procrastinate_fetch_job($1) WHERE id IS NOT NULL",
    )
    .bind(queues)
    .fetch_optional(executor)
    .await
    .map_err(StoreError::query("fetch_job"))
}
