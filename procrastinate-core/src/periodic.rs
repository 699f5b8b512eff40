use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::JobStore;
use crate::task::{Task, TaskRegistry};
use crate::types::JobArgs;

/// How late a slot may be and still get deferred. Anything older is
/// skipped: catching up on one missed slot is a feature, replaying an
/// outage's worth of them is not.
pub const DEFAULT_MAX_DELAY_SECONDS: i64 = 600;

/// A cron expression plus the args its periodic jobs are deferred with.
#[derive(Clone)]
pub struct PeriodicSchedule {
    expression: String,
    schedule: Schedule,
    args: JobArgs,
}

impl PeriodicSchedule {
    /// Accepts standard five-field cron expressions as well as the
    /// six/seven-field form with a seconds column; five-field input gets
    /// seconds pinned to zero.
    pub fn parse(expression: &str) -> Result<Self, cron::error::Error> {
        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {expression}")
        } else {
            expression.to_owned()
        };
        let schedule = Schedule::from_str(&normalized)?;
        Ok(Self {
            expression: expression.to_owned(),
            schedule,
            args: JobArgs::new(),
        })
    }

    pub fn with_args(mut self, args: JobArgs) -> Self {
        self.args = args;
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn args(&self) -> &JobArgs {
        &self.args
    }

    /// Next boundary strictly after `after`, evaluated in `timezone`.
    fn next_after(&self, after: DateTime<Utc>, timezone: Tz) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Most recent boundary in `(now - lookback, now]`, if any.
    fn last_elapsed(
        &self,
        now: DateTime<Utc>,
        lookback: Duration,
        timezone: Tz,
    ) -> Option<DateTime<Utc>> {
        let floor = (now - lookback).with_timezone(&timezone);
        let mut last = None;
        for boundary in self.schedule.after(&floor) {
            let boundary = boundary.with_timezone(&Utc);
            if boundary <= now {
                last = Some(boundary);
            } else {
                break;
            }
        }
        last
    }
}

struct ScheduledTask {
    task: Arc<Task>,
    schedule: PeriodicSchedule,
    next: Option<DateTime<Utc>>,
}

/// Enqueues periodic jobs at their cron boundaries. Runs inside every
/// worker process; the slot table makes concurrent deferrers harmless, so
/// there is no leader election, just one winner per slot.
pub struct PeriodicDeferrer {
    store: JobStore,
    timezone: Tz,
    max_delay: Duration,
    shutdown: CancellationToken,
    entries: Vec<ScheduledTask>,
}

impl PeriodicDeferrer {
    pub fn new(
        store: JobStore,
        registry: &TaskRegistry,
        timezone: Tz,
        shutdown: CancellationToken,
    ) -> Self {
        let entries = registry
            .periodic_tasks()
            .filter_map(|task| {
                let schedule = task.periodic()?.clone();
                Some(ScheduledTask {
                    task: task.clone(),
                    schedule,
                    next: None,
                })
            })
            .collect();

        Self {
            store,
            timezone,
            max_delay: Duration::seconds(DEFAULT_MAX_DELAY_SECONDS),
            shutdown,
            entries,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Runs until shutdown. Slots are processed strictly in time order, one
    /// at a time; a worker restarting just after a boundary still defers
    /// that boundary's slot (if it is within `max_delay`), and the slot
    /// table keeps the rest of the cluster from doubling it.
    pub async fn run(mut self) {
        if self.entries.is_empty() {
            debug!("no periodic tasks registered");
            self.shutdown.cancelled().await;
            return;
        }

        let now = Utc::now();
        for entry in &mut self.entries {
            // Start from the most recent elapsed boundary so a restart
            // does not skip the slot it landed on.
            entry.next = entry
                .schedule
                .last_elapsed(now, self.max_delay, self.timezone)
                .or_else(|| entry.schedule.next_after(now, self.timezone));
        }

        info!(
            tasks = self.entries.len(),
            timezone = %self.timezone,
            "periodic deferrer started"
        );

        loop {
            let Some((soonest, due_at)) = self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| entry.next.map(|next| (index, next)))
                .min_by_key(|(_, next)| *next)
            else {
                // Every schedule ran out (years-bounded expressions can).
                self.shutdown.cancelled().await;
                return;
            };

            let now = Utc::now();
            if due_at > now {
                let wait = (due_at - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            if now - due_at <= self.max_delay {
                let entry = &self.entries[soonest];
                self.defer_slot(&entry.task, &entry.schedule, due_at).await;
            } else {
                let entry = &self.entries[soonest];
                debug!(
                    task = entry.task.name(),
                    slot = due_at.timestamp(),
                    "skipping stale periodic slot"
                );
            }
            let entry = &mut self.entries[soonest];
            entry.next = entry.schedule.next_after(due_at, self.timezone);
        }
    }

    async fn defer_slot(&self, task: &Task, schedule: &PeriodicSchedule, slot: DateTime<Utc>) {
        let deferred = self
            .store
            .defer_periodic(
                task.queue_name(),
                task.name(),
                slot.timestamp(),
                schedule.args(),
            )
            .await;

        match deferred {
            Ok(Some(job_id)) => {
                info!(
                    task = task.name(),
                    job_id,
                    slot = slot.timestamp(),
                    "deferred periodic job"
                );
            }
            Ok(None) => {
                debug!(
                    task = task.name(),
                    slot = slot.timestamp(),
                    "periodic slot already deferred elsewhere"
                );
            }
            Err(error) => {
                warn!(
                    %error,
                    task = task.name(),
                    slot = slot.timestamp(),
                    "failed to defer periodic job"
                );
            }
        }
    }
}
