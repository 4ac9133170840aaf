//! What happens to a job after a run: completion, rescheduling, backoff.
//!
//! [`decide`] is pure so the retry schedule can be tested without a store or
//! a clock; [`complete`] performs the writes.

use std::time::Duration;

use cadence_store::{JobFilter, JobRecord, JobStatus, JobUpdate, LockFilter};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::interval::add_duration;
use crate::scheduler::Inner;
use crate::{JobError, JobRef, SchedulerEvent};

/// Recurring jobs at or below this interval are retried on their normal
/// cadence instead of backing off.
pub const SHORT_INTERVAL_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Delay before retrying a long-interval recurring job after its n-th
/// consecutive failure. `None` means stop retrying.
pub fn backoff_delay(consecutive_failures: u32) -> Option<Duration> {
    match consecutive_failures {
        1 => Some(Duration::from_secs(5 * 60)),
        2 => Some(Duration::from_secs(15 * 60)),
        3 => Some(Duration::from_secs(30 * 60)),
        _ => None,
    }
}

/// The state a job moves to after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// One-shot success.
    Done,
    /// One-shot failure. The error write already left it in `Error`.
    Failed,
    /// Recurring job goes back to `Scheduled`.
    Rescheduled {
        next_run_at: DateTime<Utc>,
        err_counter: u32,
    },
    /// Recurring job failed too often; it stays in `Error` with no next run.
    GaveUp { err_counter: u32 },
}

impl Decision {
    /// The store write that realizes this decision, if one is needed.
    pub fn update(&self) -> Option<JobUpdate> {
        match self {
            Decision::Done => Some(
                JobUpdate::new()
                    .status(JobStatus::Done)
                    .locked_at(None)
                    .last_error(None),
            ),
            Decision::Failed => None,
            Decision::Rescheduled {
                next_run_at,
                err_counter,
            } => Some(
                JobUpdate::new()
                    .status(JobStatus::Scheduled)
                    .next_run_at(Some(*next_run_at))
                    .err_counter(*err_counter)
                    .release_lease(),
            ),
            Decision::GaveUp { err_counter } => Some(
                JobUpdate::new()
                    .status(JobStatus::Error)
                    .next_run_at(None)
                    .err_counter(*err_counter)
                    .release_lease(),
            ),
        }
    }
}

/// Decide where `job` goes after a run that finished at `now`.
pub fn decide(job: &JobRecord, succeeded: bool, now: DateTime<Utc>) -> Decision {
    let Some(interval_ms) = job.interval_ms else {
        return if succeeded {
            Decision::Done
        } else {
            Decision::Failed
        };
    };
    let interval = Duration::from_millis(interval_ms);
    let after = |delay: Duration| add_duration(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC);

    if succeeded {
        return Decision::Rescheduled {
            next_run_at: after(interval),
            err_counter: 0,
        };
    }

    let err_counter = job.err_counter.saturating_add(1);
    if interval <= SHORT_INTERVAL_THRESHOLD {
        return Decision::Rescheduled {
            next_run_at: after(interval),
            err_counter,
        };
    }

    match backoff_delay(err_counter) {
        Some(delay) => Decision::Rescheduled {
            next_run_at: after(delay),
            err_counter,
        },
        None => Decision::GaveUp { err_counter },
    }
}

/// The write recording a failed run: `status = error` plus the message.
pub fn error_update(error: &JobError) -> JobUpdate {
    JobUpdate::new()
        .status(JobStatus::Error)
        .last_error(Some(error.to_string()))
}

/// Matches `job` only while it still holds the lease it was claimed with.
fn lease_guard(job: &JobRecord) -> JobFilter {
    JobFilter::by_id(&job.id).lock(LockFilter::LockedAt(job.locked_at))
}

/// Matches `job` until some worker claims it again after this run's claim:
/// the lease is either released or no newer than the one this run held.
fn late_guard(job: &JobRecord) -> JobFilter {
    let filter = JobFilter::by_id(&job.id);
    match job.locked_at {
        Some(claimed) => filter.lock(LockFilter::UnlockedOrExpired { deadline: claimed }),
        None => filter,
    }
}

/// Write `update` under the job's lease. Returns whether it landed.
async fn write_under_lease(inner: &Inner, job: &JobRecord, update: &JobUpdate) -> bool {
    match inner.store.update_one(&lease_guard(job), update).await {
        Ok(true) => true,
        Ok(false) => {
            warn!(
                id = %job.id,
                name = %job.name,
                "lease lost before completion was written, leaving job to its new owner"
            );
            false
        }
        Err(e) => {
            error!(id = %job.id, name = %job.name, error = %e, "failed to write job completion");
            inner.emit(SchedulerEvent::job_error(job, &e));
            false
        }
    }
}

/// Record the outcome of a run and move the job to its next state.
pub(crate) async fn complete(inner: &Inner, job: &JobRecord, outcome: Result<(), JobError>) {
    if let Err(err) = &outcome {
        warn!(id = %job.id, name = %job.name, error = %err, "job failed");
        let written = write_under_lease(inner, job, &error_update(err)).await;
        inner.emit(SchedulerEvent::job_error(job, err));
        if !written {
            return;
        }
    }

    let decision = decide(job, outcome.is_ok(), Utc::now());
    if let Some(update) = decision.update()
        && !write_under_lease(inner, job, &update).await
    {
        return;
    }

    let job_ref = JobRef::from(job);
    match decision {
        Decision::Done => {
            info!(id = %job.id, name = %job.name, "job done");
            inner.emit(SchedulerEvent::Completed { job: job_ref });
        }
        Decision::Failed => {}
        Decision::Rescheduled {
            next_run_at,
            err_counter,
        } => {
            debug!(id = %job.id, name = %job.name, %next_run_at, err_counter, "rescheduled recurring job");
            inner.emit(SchedulerEvent::Rescheduled {
                job: job_ref,
                next_run_at,
                err_counter,
            });
        }
        Decision::GaveUp { err_counter } => {
            error!(
                id = %job.id,
                name = %job.name,
                failures = err_counter,
                "job failed {} times, will not be rescheduled",
                err_counter
            );
            inner.emit(SchedulerEvent::GaveUp {
                job: job_ref,
                failures: err_counter,
            });
        }
    }
}

/// Note a settlement that arrived after the run's outcome was recorded.
///
/// Only `last_error` is touched; status and schedule already belong to the
/// first outcome. Once another claim has taken the job the note is dropped.
pub(crate) async fn record_late_completion(
    inner: &Inner,
    job: &JobRecord,
    elapsed: Duration,
    timeout: Duration,
) {
    let err = JobError::LateCompletion { elapsed, timeout };
    warn!(id = %job.id, name = %job.name, error = %err, "late job completion");

    let update = JobUpdate::new().last_error(Some(err.to_string()));
    match inner.store.update_one(&late_guard(job), &update).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(id = %job.id, name = %job.name, "job was reclaimed, not recording late completion");
        }
        Err(e) => error!(id = %job.id, error = %e, "failed to record late completion"),
    }

    inner.emit(SchedulerEvent::job_error(job, &err));
    inner.emit(SchedulerEvent::LateCompletion {
        job: JobRef::from(job),
        elapsed,
        timeout,
    });
}
