use thiserror::Error;

/// Errors establishing or keeping database connections. Transient drops on
/// the LISTEN connection are retried internally and never reach callers;
/// what surfaces here is configuration that will not start working on its
/// own (bad DSN, auth, pool exhaustion at startup).
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("pool creation failed with: {error}")]
    PoolCreation {
        #[source]
        error: sqlx::Error,
    },
    #[error("connection failed with: {error}")]
    Connection {
        #[source]
        error: sqlx::Error,
    },
    #[error("schema migration failed with: {error}")]
    Migration {
        #[source]
        error: sqlx::migrate::MigrateError,
    },
}

/// Errors from the queue protocol itself.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{command} query failed with: {error}")]
    Query {
        command: &'static str,
        #[source]
        error: sqlx::Error,
    },
    /// The queueing lock already has a live (todo or doing) job. Never
    /// retried: the point of the lock is that this defer must not happen.
    #[error("a job with queueing lock {queueing_lock:?} is already waiting or running")]
    AlreadyEnqueued { queueing_lock: String },
    /// A finish or retry found the row not in `doing`. Either the caller
    /// double-reported, or the janitor reaped the job out from under a
    /// stalled worker.
    #[error("job {job_id} is not in doing status")]
    UnexpectedJobStatus { job_id: i64 },
    #[error("could not serialize jsonb args: {error}")]
    Serialization {
        #[from]
        error: serde_json::Error,
    },
    #[error("{0} is not a valid job status")]
    InvalidStatus(String),
}

impl StoreError {
    pub(crate) fn query(command: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
        move |error| StoreError::Query { command, error }
    }
}

/// Errors that stop a worker. Anything scoped to a single job (handler
/// failures, unknown task names, lost locks) is handled in the loop and
/// never becomes one of these.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("no task named {task_name} is registered on this worker")]
    TaskNotFound { task_name: String },
    #[error("a sub-worker panicked")]
    SubWorkerPanic,
}
