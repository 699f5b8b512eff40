use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::DoneStatus;

/// Closes a `doing` job as succeeded or failed, incrementing `attempts`.
pub async fn finish_job<'c, E>(executor: E, job_id: i64, status: DoneStatus) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let affected: i32 = sqlx::query_scalar("SELECT procrastinate_finish_job($1, $2)")
        .bind(job_id)
        .bind(status.as_str())
        .fetch_one(executor)
        .await
        .map_err(StoreError::query("finish_job"))?;
    throw_if_no_rows(affected, job_id)
}

/// Returns a `doing` job to `todo` for a later attempt, incrementing
/// `attempts` and setting `scheduled_at`. This is the one path that
/// re-opens a claimed row.
pub async fn retry_job<'c, E>(
    executor: E,
    job_id: i64,
    retry_at: DateTime<Utc>,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let affected: i32 = sqlx::query_scalar("SELECT procrastinate_retry_job($1, $2)")
        .bind(job_id)
        .bind(retry_at)
        .fetch_one(executor)
        .await
        .map_err(StoreError::query("retry_job"))?;
    throw_if_no_rows(affected, job_id)
}

// Both procedures are conditional on the row being 'doing'; zero rows means
// the caller no longer owns the job.
fn throw_if_no_rows(affected: i32, job_id: i64) -> Result<(), StoreError> {
    if affected == 0 {
        Err(StoreError::UnexpectedJobStatus { job_id })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rows_is_unexpected_status() {
        let error = throw_if_no_rows(0, 42).expect_err("expected error on zero rows");
        assert!(matches!(
            error,
            StoreError::UnexpectedJobStatus { job_id: 42 }
        ));
        throw_if_no_rows(1, 42).expect("one row is fine");
    }
}
