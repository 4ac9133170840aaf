//! Lease-based distributed job scheduler for Cadence.
//!
//! Any number of workers share one [`JobStore`](cadence_store::JobStore) and
//! coordinate only through its atomic conditional update:
//! - One-shot and recurring (interval) jobs, de-duplicated by `(name, data)`
//! - Time-bounded leases, so a crashed worker's jobs are reclaimed
//! - Bounded batch claiming per scan tick
//! - Per-job timeouts that never cancel the processor
//! - Escalating backoff for failing recurring jobs

mod config;
mod error;
mod events;
pub mod interval;
pub mod policy;
mod registry;
mod scheduler;
mod supervisor;

pub use config::SchedulerConfig;
pub use error::{JobError, SchedulerError};
pub use events::{JobRef, SchedulerEvent};
pub use interval::When;
pub use registry::{Completion, Definition, JobOptions, JobRegistry, Processor, ProcessorResult};
pub use scheduler::{EveryOptions, Scheduler};

pub use cadence_store::{JobFilter, JobId, JobRecord, JobStatus, JobStore};
