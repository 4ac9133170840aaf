//! Typed filters and updates over job records.
//!
//! Every store evaluates the same [`JobFilter::matches`] and applies the same
//! [`JobUpdate::apply`], so the semantics below hold regardless of backend.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{JobId, JobRecord, JobStatus};

/// Predicate over a record's lease.
#[derive(Debug, Clone, PartialEq)]
pub enum LockFilter {
    /// No lease, or a lease acquired at or before `deadline` (a dead lease).
    UnlockedOrExpired { deadline: DateTime<Utc> },
    /// A lease acquired at or before the given instant.
    LockedAtOrBefore(DateTime<Utc>),
    /// A lease acquired at exactly the given instant (or no lease when `None`).
    LockedAt(Option<DateTime<Utc>>),
}

impl LockFilter {
    fn matches(&self, locked_at: Option<DateTime<Utc>>) -> bool {
        match self {
            LockFilter::UnlockedOrExpired { deadline } => match locked_at {
                None => true,
                Some(at) => at <= *deadline,
            },
            LockFilter::LockedAtOrBefore(deadline) => locked_at.is_some_and(|at| at <= *deadline),
            LockFilter::LockedAt(expected) => locked_at == *expected,
        }
    }
}

/// Conjunction of optional conditions. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub id: Option<JobId>,
    pub name: Option<String>,
    /// Name must be one of these. An empty list matches nothing.
    pub names: Option<Vec<String>>,
    /// Exact payload equality.
    pub data: Option<Value>,
    /// Status must be one of these. An empty list matches nothing.
    pub statuses: Option<Vec<JobStatus>>,
    /// `next_run_at` must be set and not later than this.
    pub next_run_at_lte: Option<DateTime<Utc>>,
    pub lock: Option<LockFilter>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a single record by id.
    pub fn by_id(id: &JobId) -> Self {
        Self::new().id(id.clone())
    }

    /// Match the de-duplication key `(name, data)`.
    pub fn by_key(name: &str, data: &Value) -> Self {
        Self::new().name(name).data(data.clone())
    }

    pub fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn names(mut self, names: Vec<String>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn status(self, status: JobStatus) -> Self {
        self.statuses(vec![status])
    }

    pub fn statuses(mut self, statuses: Vec<JobStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn next_run_at_lte(mut self, horizon: DateTime<Utc>) -> Self {
        self.next_run_at_lte = Some(horizon);
        self
    }

    pub fn lock(mut self, lock: LockFilter) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Evaluate this filter against a record.
    pub fn matches(&self, record: &JobRecord) -> bool {
        if self.id.as_ref().is_some_and(|id| *id != record.id) {
            return false;
        }
        if self.name.as_ref().is_some_and(|name| *name != record.name) {
            return false;
        }
        if self
            .names
            .as_ref()
            .is_some_and(|names| !names.iter().any(|n| *n == record.name))
        {
            return false;
        }
        if self.data.as_ref().is_some_and(|data| *data != record.data) {
            return false;
        }
        if self
            .statuses
            .as_ref()
            .is_some_and(|statuses| !statuses.contains(&record.status))
        {
            return false;
        }
        if let Some(horizon) = self.next_run_at_lte {
            match record.next_run_at {
                Some(at) if at <= horizon => {}
                _ => return false,
            }
        }
        if let Some(lock) = &self.lock
            && !lock.matches(record.locked_at)
        {
            return false;
        }
        true
    }
}

/// A set of field assignments. Fields left as `None` are untouched; nullable
/// fields use `Some(None)` to clear.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub locked_at: Option<Option<DateTime<Utc>>>,
    pub worker_id: Option<Option<String>>,
    pub err_counter: Option<u32>,
    pub last_error: Option<Option<String>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn next_run_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn locked_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.locked_at = Some(at);
        self
    }

    pub fn worker_id(mut self, worker_id: Option<String>) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn err_counter(mut self, count: u32) -> Self {
        self.err_counter = Some(count);
        self
    }

    pub fn last_error(mut self, message: Option<String>) -> Self {
        self.last_error = Some(message);
        self
    }

    /// Release the lease: clear both `locked_at` and `worker_id`.
    pub fn release_lease(self) -> Self {
        self.locked_at(None).worker_id(None)
    }

    /// Whether applying this update would change nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the assignments to a record in place.
    pub fn apply(&self, record: &mut JobRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(at) = self.next_run_at {
            record.next_run_at = at;
        }
        if let Some(at) = self.locked_at {
            record.locked_at = at;
        }
        if let Some(worker_id) = &self.worker_id {
            record.worker_id = worker_id.clone();
        }
        if let Some(count) = self.err_counter {
            record.err_counter = count;
        }
        if let Some(message) = &self.last_error {
            record.last_error = message.clone();
        }
    }
}
