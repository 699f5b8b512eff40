use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{pool::PoolOptions, PgPool};

// A pool config object, designed to be passable across API boundaries
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub max_connections: Option<u32>,         // Default to 10
    pub min_connections: Option<u32>,         // Default to 1
    pub acquire_timeout_seconds: Option<u64>, // Default to 30
    pub max_lifetime_seconds: Option<u64>,    // Default to 300
    pub idle_timeout_seconds: Option<u64>,    // Default to 60
}

impl PoolConfig {
    pub fn new(db_url: &str) -> Self {
        Self {
            db_url: db_url.to_owned(),
            max_connections: None,
            min_connections: None,
            acquire_timeout_seconds: None,
            max_lifetime_seconds: None,
            idle_timeout_seconds: None,
        }
    }

    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        let builder = PoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(10))
            .min_connections(self.min_connections.unwrap_or(1))
            .max_lifetime(Duration::from_secs(
                self.max_lifetime_seconds.unwrap_or(300),
            ))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds.unwrap_or(60)))
            .acquire_timeout(Duration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(30),
            ));

        builder.connect(&self.db_url).await
    }
}

pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_POLLING_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_SHUTDOWN_GRACEFUL_TIMEOUT_SECONDS: u64 = 30;

/// Runtime knobs for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifies this process in logs. Defaults to a fresh UUID.
    pub worker_id: String,
    /// Queues to serve; `None` serves every queue.
    pub queues: Option<Vec<String>>,
    /// Number of sub-workers, each with at most one job in flight.
    pub concurrency: usize,
    /// How long an idle sub-worker waits before re-polling when no
    /// notification arrives.
    pub polling_interval: Duration,
    /// Phase one of shutdown: how long in-flight jobs get to finish before
    /// cancellation is delivered to their handlers.
    pub shutdown_graceful_timeout: Duration,
    /// Wake idle sub-workers on NOTIFY. Polling still runs either way.
    pub listen_notify: bool,
    /// Timezone for cron evaluation. Always explicit, never taken from the
    /// process environment.
    pub timezone: chrono_tz::Tz,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::now_v7().to_string(),
            queues: None,
            concurrency: DEFAULT_CONCURRENCY,
            polling_interval: Duration::from_secs(DEFAULT_POLLING_INTERVAL_SECONDS),
            shutdown_graceful_timeout: Duration::from_secs(
                DEFAULT_SHUTDOWN_GRACEFUL_TIMEOUT_SECONDS,
            ),
            listen_notify: true,
            timezone: chrono_tz::Tz::UTC,
        }
    }
}
