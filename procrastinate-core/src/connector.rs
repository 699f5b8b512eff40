use std::time::Duration;

use rand::Rng;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::ConnectorError;

/// Channel notified for every deferred job, regardless of queue.
pub const ANY_QUEUE_CHANNEL: &str = "procrastinate_any_queue";

/// Channel notified for jobs deferred on one queue.
pub fn queue_channel(queue_name: &str) -> String {
    format!("procrastinate_queue#{queue_name}")
}

/// Owns every database connection the queue uses: a statement pool shared by
/// all callers, and (once `start_listener` is called) one dedicated LISTEN
/// connection. Store operations take any `sqlx::Executor`, so the pool, a
/// borrowed connection, or an open transaction all work as the statement
/// side of this.
pub struct Connector {
    pool: PgPool,
}

impl Connector {
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

    /// Spawns the LISTEN task. Every notification on any of `channels` bumps
    /// the returned hub's wake counter; subscribers resume on any bump. The
    /// payload is deliberately not forwarded: notifications are advisory and
    /// workers re-poll regardless, so losing or collapsing them is fine.
    ///
    /// The task reconnects with bounded exponential backoff when the LISTEN
    /// connection drops, and exits when `shutdown` is cancelled.
    pub fn start_listener(
        &self,
        channels: Vec<String>,
        shutdown: CancellationToken,
    ) -> NotificationHub {
        let (tx, rx) = watch::channel(0u64);
        let task = tokio::spawn(listen_forever(self.pool.clone(), channels, tx, shutdown));
        NotificationHub { rx, task }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Fan-out side of the LISTEN connection. Cheap to subscribe from every
/// sub-worker; see [`Connector::start_listener`].
pub struct NotificationHub {
    rx: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl NotificationHub {
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.rx.clone()
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn listen_forever(
    pool: PgPool,
    channels: Vec<String>,
    tx: watch::Sender<u64>,
    shutdown: CancellationToken,
) {
    let mut backoff = ReconnectBackoff::new();

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match connect_and_listen(&pool, &channels).await {
            Ok(mut listener) => {
                info!(channels = channels.len(), "listening for queue notifications");
                backoff.reset();
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        received = listener.recv() => match received {
                            Ok(notification) => {
                                debug!(
                                    channel = notification.channel(),
                                    "received queue notification"
                                );
                                tx.send_modify(|wakeups| *wakeups = wakeups.wrapping_add(1));
                            }
                            Err(error) => {
                                warn!(%error, "notification connection lost, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
            Err(error) => {
                warn!(%error, "could not establish notification connection");
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn connect_and_listen(pool: &PgPool, channels: &[String]) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener
        .listen_all(channels.iter().map(String::as_str))
        .await?;
    Ok(listener)
}

/// Exponential reconnect delay, capped, with a little jitter so a fleet of
/// workers does not hammer a recovering database in lockstep.
struct ReconnectBackoff {
    failures: u32,
}

const RECONNECT_BASE_MS: u64 = 200;
const RECONNECT_MAX_MS: u64 = 30_000;

impl ReconnectBackoff {
    fn new() -> Self {
        Self { failures: 0 }
    }

    fn reset(&mut self) {
        self.failures = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let exponent = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        let base = RECONNECT_BASE_MS
            .saturating_mul(1u64 << exponent)
            .min(RECONNECT_MAX_MS);
        let jitter = rand::thread_rng().gen_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }
}
