use chrono::{Duration, Utc};
use procrastinate_core::{JobStore, StoreError};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct JanitorSettings {
    pub stalled_timeout: Duration,
    pub retention: Duration,
    pub delete_failed: bool,
}

/// Repairs what crashed workers leave behind and keeps the jobs table from
/// growing without bound. Safe to run alongside any number of workers, and
/// alongside other janitors: both operations are plain row-conditional
/// updates.
pub struct Janitor {
    store: JobStore,
    settings: JanitorSettings,
}

impl Janitor {
    pub fn new(store: JobStore, settings: JanitorSettings) -> Self {
        Self { store, settings }
    }

    pub async fn run_migrations(&self) {
        self.store
            .run_migrations()
            .await
            .expect("failed to apply the queue schema");
    }

    pub async fn run_once(&self) -> Result<(), StoreError> {
        let stalled = self
            .store
            .retry_stalled_jobs(Utc::now() - self.settings.stalled_timeout)
            .await?;
        if stalled > 0 {
            warn!("returned {} stalled jobs to the queue", stalled);
        }

        let deleted = self
            .store
            .delete_old_jobs(
                Utc::now() - self.settings.retention,
                self.settings.delete_failed,
            )
            .await?;
        if deleted > 0 {
            info!("deleted {} finished jobs", deleted);
        }

        Ok(())
    }
}
