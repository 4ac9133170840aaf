//! Job record types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Store-assigned identity of a job record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_run_at`.
    #[default]
    Scheduled,
    /// Claimed by a worker (or abandoned by one whose lease has since expired).
    Processing,
    /// A one-shot job that completed successfully.
    Done,
    /// The last run failed.
    Error,
}

impl JobStatus {
    /// Stable lowercase name, as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(format!(
                "unknown job status '{}', expected scheduled/processing/done/error",
                other
            )),
        }
    }
}

/// A persisted unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Selects the processor that runs this job.
    pub name: String,
    /// Processor input. Together with `name` this is the de-duplication key.
    #[serde(default)]
    pub data: Value,
    pub status: JobStatus,
    /// Earliest time the job may be claimed. `None` once a recurring job gave up.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Recurrence period in milliseconds. Presence marks the job recurring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// The interval expression the job was created with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_str: Option<String>,
    /// Lease acquisition time; `None` means unowned.
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
    /// Owner of the current lease.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Consecutive failures of the current recurrence chain.
    #[serde(default)]
    pub err_counter: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Whether this job reschedules itself after each run.
    pub fn is_recurring(&self) -> bool {
        self.interval_ms.is_some()
    }
}

/// A record about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub data: Value,
    pub next_run_at: DateTime<Utc>,
    pub interval_ms: Option<u64>,
    pub interval_str: Option<String>,
}

impl NewJob {
    /// A one-shot job due at `next_run_at`.
    pub fn once(name: impl Into<String>, data: Value, next_run_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            data,
            next_run_at,
            interval_ms: None,
            interval_str: None,
        }
    }

    /// Mark the job as recurring every `interval_ms` milliseconds.
    pub fn recurring(mut self, interval_ms: u64, interval_str: impl Into<String>) -> Self {
        self.interval_ms = Some(interval_ms);
        self.interval_str = Some(interval_str.into());
        self
    }

    /// Materialize the record a store will hold, in `Scheduled` state.
    pub fn into_record(self, id: JobId) -> JobRecord {
        JobRecord {
            id,
            name: self.name,
            data: self.data,
            status: JobStatus::Scheduled,
            next_run_at: Some(self.next_run_at),
            interval_ms: self.interval_ms,
            interval_str: self.interval_str,
            locked_at: None,
            worker_id: None,
            err_counter: 0,
            last_error: None,
        }
    }
}
