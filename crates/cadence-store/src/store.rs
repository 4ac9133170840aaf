//! The store boundary.

use async_trait::async_trait;

use crate::{JobFilter, JobId, JobRecord, JobUpdate, NewJob, StoreError};

/// Document store holding job records.
///
/// Implementations must make [`find_one_and_update`](JobStore::find_one_and_update)
/// linearizable per record: when several callers race on the same filter, each
/// matching record is observed and mutated by at most one of them. The lease
/// protocol relies on nothing else.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record in `Scheduled` state and return its id.
    async fn insert_one(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Return any one record matching `filter`.
    async fn find_one(&self, filter: &JobFilter) -> Result<Option<JobRecord>, StoreError>;

    /// Return every record matching `filter`, in insertion order.
    async fn find_many(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError>;

    /// Atomically pick one record matching `filter`, apply `update`, and return
    /// the record as it is after the update.
    async fn find_one_and_update(
        &self,
        filter: &JobFilter,
        update: &JobUpdate,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Apply `update` to the first record matching `filter`. Returns whether a
    /// record matched.
    async fn update_one(&self, filter: &JobFilter, update: &JobUpdate) -> Result<bool, StoreError>;

    /// Delete every record matching `filter`. Returns the number deleted.
    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StoreError>;

    /// Delete every record.
    async fn drop_all(&self) -> Result<u64, StoreError> {
        self.delete_many(&JobFilter::new()).await
    }
}
