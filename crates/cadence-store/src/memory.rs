//! In-process job store.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::{JobFilter, JobId, JobRecord, JobStore, JobUpdate, NewJob, StoreError};

/// Job store kept entirely in memory.
///
/// Every operation runs under a single lock, so conditional updates are
/// linearizable across all records, which is stronger than the per-record
/// guarantee [`JobStore`] requires. Share one instance through an `Arc` to let
/// several schedulers in the same process coordinate.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<Vec<JobRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `records`.
    pub fn from_records(records: Vec<JobRecord>) -> Self {
        Self {
            jobs: RwLock::new(records),
        }
    }

    /// Copy of every record, in insertion order.
    pub async fn snapshot(&self) -> Vec<JobRecord> {
        self.jobs.read().await.clone()
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

/// Append `job` as a new `Scheduled` record.
pub(crate) fn insert(jobs: &mut Vec<JobRecord>, job: NewJob) -> JobId {
    let id = JobId::generate();
    let record = job.into_record(id.clone());
    trace!(id = %id, name = %record.name, "inserting job");
    jobs.push(record);
    id
}

/// Apply `update` to the first record matching `filter`, returning it.
pub(crate) fn find_and_update(
    jobs: &mut [JobRecord],
    filter: &JobFilter,
    update: &JobUpdate,
) -> Option<JobRecord> {
    jobs.iter_mut().find(|j| filter.matches(j)).map(|j| {
        update.apply(j);
        j.clone()
    })
}

/// Drop every record matching `filter`, returning how many went.
pub(crate) fn delete(jobs: &mut Vec<JobRecord>, filter: &JobFilter) -> u64 {
    let before = jobs.len();
    jobs.retain(|j| !filter.matches(j));
    let deleted = (before - jobs.len()) as u64;
    if deleted > 0 {
        trace!(deleted, "deleted jobs");
    }
    deleted
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_one(&self, job: NewJob) -> Result<JobId, StoreError> {
        Ok(insert(&mut *self.jobs.write().await, job))
    }

    async fn find_one(&self, filter: &JobFilter) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().find(|j| filter.matches(j)).cloned())
    }

    async fn find_many(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().filter(|j| filter.matches(j)).cloned().collect())
    }

    async fn find_one_and_update(
        &self,
        filter: &JobFilter,
        update: &JobUpdate,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut jobs = self.jobs.write().await;
        Ok(find_and_update(&mut jobs, filter, update))
    }

    async fn update_one(&self, filter: &JobFilter, update: &JobUpdate) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        Ok(find_and_update(&mut jobs, filter, update).is_some())
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        Ok(delete(&mut *self.jobs.write().await, filter))
    }
}
