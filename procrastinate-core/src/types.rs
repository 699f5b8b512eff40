use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Task arguments, stored in the `args` jsonb column.
pub type JobArgs = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue, possibly until a future `scheduled_at`.
    Todo,
    /// Claimed by exactly one worker.
    Doing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Todo => "todo",
            JobStatus::Doing => "doing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Terminal rows are never fetched again; they only leave the table
    /// through the janitor.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(JobStatus::Todo),
            "doing" => Ok(JobStatus::Doing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(StoreError::InvalidStatus(invalid.to_owned())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The end states a worker can report for a claimed job. Retrying is its own
/// operation because it re-opens the row instead of closing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneStatus {
    Succeeded,
    Failed,
}

impl DoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoneStatus::Succeeded => "succeeded",
            DoneStatus::Failed => "failed",
        }
    }
}

/// One row of `procrastinate_jobs`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub queue_name: String,
    pub task_name: String,
    /// Execution-side serialization key: jobs sharing it run one at a time.
    pub lock: Option<String>,
    /// Admission-side exclusivity key: at most one live job per value.
    pub queueing_lock: Option<String>,
    pub args: sqlx::types::Json<JobArgs>,
    pub status: JobStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: i32,
}

/// The chunk of data needed to defer a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredJob {
    pub queue_name: String,
    pub task_name: String,
    pub args: JobArgs,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
}

impl DeferredJob {
    pub fn new(queue_name: &str, task_name: &str) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            task_name: task_name.to_owned(),
            args: JobArgs::new(),
            scheduled_at: None,
            lock: None,
            queueing_lock: None,
        }
    }

    pub fn with_args(mut self, args: JobArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn with_lock(mut self, lock: &str) -> Self {
        self.lock = Some(lock.to_owned());
        self
    }

    pub fn with_queueing_lock(mut self, queueing_lock: &str) -> Self {
        self.queueing_lock = Some(queueing_lock.to_owned());
        self
    }
}

/// Criteria for listing jobs. All-`None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub id: Option<i64>,
    pub queue_name: Option<String>,
    pub task_name: Option<String>,
    pub status: Option<JobStatus>,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
}

/// One row of the append-only `procrastinate_events` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: i64,
    #[sqlx(rename = "type")]
    pub event_type: String,
    pub at: DateTime<Utc>,
}
