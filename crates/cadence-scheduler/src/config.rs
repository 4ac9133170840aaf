//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Default lease lifetime (10 minutes).
pub const DEFAULT_LOCK_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// Default number of claim attempts per scan tick.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default scan tick period (2 seconds).
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Default processor timeout (20 seconds).
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(20);

/// Configuration for a [`Scheduler`](crate::Scheduler).
///
/// Durations serialize as integer milliseconds.
///
/// ```rust
/// use std::time::Duration;
/// use cadence_scheduler::SchedulerConfig;
///
/// let config = SchedulerConfig::default()
///     .worker_id("worker-a")
///     .concurrency(4)
///     .scan_interval(Duration::from_millis(500));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Identity written into every lease this scheduler takes.
    pub worker_id: String,

    /// How long a lease stays valid. A `processing` job whose lease is older
    /// than this is considered abandoned and may be claimed again.
    #[serde(with = "duration_ms")]
    pub lock_lifetime: Duration,

    /// Claim attempts per scan tick; bounds the size of one batch.
    pub concurrency: usize,

    /// Period of the scan loop.
    #[serde(with = "duration_ms")]
    pub scan_interval: Duration,

    /// Processor timeout for jobs defined without one.
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,

    /// When false, [`Scheduler::open`](crate::Scheduler::open) does not arm
    /// the scan loop: the instance only manages records.
    pub process_jobs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: "0".to_string(),
            lock_lifetime: DEFAULT_LOCK_LIFETIME,
            concurrency: DEFAULT_CONCURRENCY,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            default_timeout: DEFAULT_JOB_TIMEOUT,
            process_jobs: true,
        }
    }
}

impl SchedulerConfig {
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn lock_lifetime(mut self, lock_lifetime: Duration) -> Self {
        self.lock_lifetime = lock_lifetime;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn process_jobs(mut self, process_jobs: bool) -> Self {
        self.process_jobs = process_jobs;
        self
    }

    /// Reject settings the scan loop cannot run with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.concurrency == 0 {
            return Err(SchedulerError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.scan_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "scan_interval must be greater than zero".to_string(),
            ));
        }
        if self.lock_lifetime.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "lock_lifetime must be greater than zero".to_string(),
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "default_timeout must be greater than zero".to_string(),
            ));
        }
        if self.worker_id.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "worker_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
