//! Events broadcast by a scheduler.

use std::time::Duration;

use cadence_store::{JobId, JobRecord};
use chrono::{DateTime, Utc};

/// Identifies the job an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub id: JobId,
    pub name: String,
}

impl From<&JobRecord> for JobRef {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
        }
    }
}

/// Something observable happened. Subscribe with
/// [`Scheduler::subscribe`](crate::Scheduler::subscribe).
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Any failure: a job run, a store call in the scan loop, or a registry
    /// conflict (`job` is `None` for the latter two).
    Error {
        job: Option<JobRef>,
        message: String,
    },
    /// A one-shot job finished successfully.
    Completed { job: JobRef },
    /// A recurring job was put back in the schedule.
    Rescheduled {
        job: JobRef,
        next_run_at: DateTime<Utc>,
        err_counter: u32,
    },
    /// A recurring job failed too many times in a row and will not run again.
    GaveUp { job: JobRef, failures: u32 },
    /// A processor settled after its outcome had already been recorded.
    LateCompletion {
        job: JobRef,
        elapsed: Duration,
        timeout: Duration,
    },
}

impl SchedulerEvent {
    /// The job this event concerns, if any.
    pub fn job(&self) -> Option<&JobRef> {
        match self {
            SchedulerEvent::Error { job, .. } => job.as_ref(),
            SchedulerEvent::Completed { job }
            | SchedulerEvent::Rescheduled { job, .. }
            | SchedulerEvent::GaveUp { job, .. }
            | SchedulerEvent::LateCompletion { job, .. } => Some(job),
        }
    }

    /// Error event for a failed job run, formatted as `Job error [name]: message`.
    pub(crate) fn job_error(job: &JobRecord, message: impl std::fmt::Display) -> Self {
        SchedulerEvent::Error {
            job: Some(JobRef::from(job)),
            message: format!("Job error [{}]: {}", job.name, message),
        }
    }
}
