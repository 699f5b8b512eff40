//! A task queue that uses PostgreSQL as its only broker. Producers defer
//! jobs; workers claim them with `FOR UPDATE SKIP LOCKED`, execute the
//! matching task and report back; LISTEN/NOTIFY keeps idle workers from
//! sleeping through fresh work. Delivery is at-least-once: handlers must
//! tolerate re-execution.

mod ops;

// We do this pattern (privately use a module, then re-export parts of it) so
// we can refactor the internals without breaking the public API.

// Types
mod types;
pub use types::DeferredJob;
pub use types::DoneStatus;
pub use types::Job;
pub use types::JobArgs;
pub use types::JobEvent;
pub use types::JobFilter;
pub use types::JobStatus;

// Errors
mod error;
// Errors about reaching the database at all - pool setup, migrations
pub use error::ConnectorError;
// Errors from the queue protocol - lost claims, queueing-lock conflicts
pub use error::StoreError;
// Errors that stop a worker (per-job problems never do)
pub use error::WorkerError;

// Connector
mod connector;
pub use connector::queue_channel;
pub use connector::Connector;
pub use connector::NotificationHub;
pub use connector::ANY_QUEUE_CHANNEL;

// Store
mod store;
pub use store::JobStore;

// Tasks
mod task;
pub use task::JobContext;
pub use task::Task;
pub use task::TaskError;
pub use task::TaskHandler;
pub use task::TaskRegistry;
pub use task::DEFAULT_QUEUE;

// Retry
mod retry;
pub use retry::Backoff;
pub use retry::RetryPolicy;
pub use retry::RetryPolicyBuilder;

// Worker
mod worker;
pub use worker::Worker;

// Periodic
mod periodic;
pub use periodic::PeriodicDeferrer;
pub use periodic::PeriodicSchedule;

// Builtin maintenance tasks
pub mod builtins;

// Config
mod config;
pub use config::PoolConfig;
pub use config::WorkerConfig;
