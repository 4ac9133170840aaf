//! Error types for the scheduler.

use std::time::Duration;

use cadence_store::{JobId, StoreError};
use thiserror::Error;

/// Errors returned to callers of scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A processor is already registered under this name.
    #[error("job processor with the name {0} already exists")]
    DuplicateDefinition(String),

    /// The time argument of a schedule call could not be understood.
    #[error("invalid time: {0}")]
    InvalidTime(String),

    /// The interval expression could not be parsed or is zero.
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Invalid scheduler configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(JobId),
}

/// Why a single job run failed.
///
/// These never propagate out of the scan loop. They are written to the job's
/// `last_error` and broadcast as [`SchedulerEvent::Error`](crate::SchedulerEvent::Error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The claimed job's name has no registered processor.
    #[error("job with the name {0} does not have a processor")]
    NoProcessor(String),

    /// The processor did not settle within its timeout. It keeps running.
    #[error("job timeout after {}ms", timeout.as_millis())]
    Timeout { timeout: Duration },

    /// The processor settled after its outcome had already been recorded.
    #[error(
        "job done after timeout. took {}ms to run, timeout: {}ms",
        elapsed.as_millis(),
        timeout.as_millis()
    )]
    LateCompletion { elapsed: Duration, timeout: Duration },

    /// The processor reported failure (or panicked).
    #[error("{0}")]
    Processor(String),
}
