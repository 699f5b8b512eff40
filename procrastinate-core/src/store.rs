use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::config::PoolConfig;
use crate::error::{ConnectorError, StoreError};
use crate::ops;
use crate::types::{DeferredJob, DoneStatus, Job, JobArgs, JobEvent, JobFilter};

/// The queue protocol, in domain terms. Stateless: every method is one
/// transaction, and all cross-worker coordination lives in the database.
/// Producers use [`defer`](JobStore::defer); workers use
/// [`fetch_one`](JobStore::fetch_one), [`finish`](JobStore::finish) and
/// [`retry`](JobStore::retry); the rest is plumbing around them.
///
/// Cloning is cheap (the pool is shared).
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub async fn connect(config: &PoolConfig) -> Result<Self, ConnectorError> {
        let pool = config
            .connect()
            .await
            .map_err(|error| ConnectorError::PoolCreation { error })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the queue schema (tables, indexes, procedures, triggers).
    pub async fn run_migrations(&self) -> Result<(), ConnectorError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| ConnectorError::Migration { error })
    }

    /// Enqueues one job and returns its id. Fails with
    /// [`StoreError::AlreadyEnqueued`] when the job carries a queueing lock
    /// that another live job holds.
    pub async fn defer(&self, job: &DeferredJob) -> Result<i64, StoreError> {
        ops::defer::defer_job(&self.pool, job).await
    }

    /// Claims the next ready job on the given queues (`None` = all),
    /// returning `None` when nothing is eligible.
    pub async fn fetch_one(&self, queues: Option<&[String]>) -> Result<Option<Job>, StoreError> {
        ops::fetch::fetch_job(&self.pool, queues).await
    }

    pub async fn finish(&self, job_id: i64, status: DoneStatus) -> Result<(), StoreError> {
        ops::finish::finish_job(&self.pool, job_id, status).await
    }

    pub async fn retry(&self, job_id: i64, retry_at: DateTime<Utc>) -> Result<(), StoreError> {
        ops::finish::retry_job(&self.pool, job_id, retry_at).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        ops::admin::list_jobs(&self.pool, filter).await
    }

    pub async fn list_events(&self, job_id: i64) -> Result<Vec<JobEvent>, StoreError> {
        ops::admin::list_events(&self.pool, job_id).await
    }

    /// Cancels a `todo` job. Returns false when the job is already claimed
    /// or terminal; cancelling running work is the worker's job, not the
    /// store's.
    pub async fn cancel(&self, job_id: i64) -> Result<bool, StoreError> {
        ops::admin::cancel_job(&self.pool, job_id).await
    }

    pub async fn delete_old_jobs(
        &self,
        finished_before: DateTime<Utc>,
        include_failed: bool,
    ) -> Result<u64, StoreError> {
        ops::admin::delete_old_jobs(&self.pool, finished_before, include_failed).await
    }

    pub async fn retry_stalled_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        ops::admin::retry_stalled_jobs(&self.pool, started_before).await
    }

    /// Defers a job for one periodic slot; `None` means another deferrer in
    /// the cluster got there first.
    pub async fn defer_periodic(
        &self,
        queue_name: &str,
        task_name: &str,
        defer_timestamp: i64,
        args: &JobArgs,
    ) -> Result<Option<i64>, StoreError> {
        ops::periodic::defer_periodic_job(&self.pool, queue_name, task_name, defer_timestamp, args)
            .await
    }

    pub async fn check_connection(&self) -> Result<(), StoreError> {
        ops::admin::check_connection(&self.pool).await
    }

    pub async fn schema_applied(&self) -> Result<bool, StoreError> {
        ops::admin::schema_applied(&self.pool).await
    }
}
