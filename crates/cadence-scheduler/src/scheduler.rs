//! Job scheduler implementation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cadence_store::{
    JobFilter, JobId, JobRecord, JobStatus, JobStore, JobUpdate, LockFilter, NewJob,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::interval::{add_duration, parse_human_interval, sub_duration};
use crate::{
    JobOptions, JobRegistry, Processor, SchedulerConfig, SchedulerError, SchedulerEvent, When,
    supervisor,
};

/// Capacity of the event channel; slow subscribers miss the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Options for [`Scheduler::every`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EveryOptions {
    /// Run the first time immediately instead of one interval from now.
    pub run_now: bool,
}

struct ScanHandle {
    stop_tx: watch::Sender<bool>,
    // Kept so the task is owned somewhere; stopping never aborts it.
    _task: JoinHandle<()>,
}

#[derive(Default)]
struct ScanState {
    handle: Option<ScanHandle>,
    next_scan_at: Option<DateTime<Utc>>,
}

/// State shared between the scheduler handle, its scan loop and every job
/// supervisor it spawns.
pub(crate) struct Inner {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) config: SchedulerConfig,
    pub(crate) registry: JobRegistry,
    events: broadcast::Sender<SchedulerEvent>,
    scan: Mutex<ScanState>,
}

impl Inner {
    pub(crate) fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn scan_state(&self) -> MutexGuard<'_, ScanState> {
        self.scan.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The job scheduler.
///
/// Cheap to clone; clones share the same registry, scan loop and events.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("jobs", &self.inner.registry.names())
            .field("processing", &self.is_processing())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler over `store`. The scan loop is not started.
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                registry: JobRegistry::new(),
                events,
                scan: Mutex::new(ScanState::default()),
            }),
        })
    }

    /// Create a scheduler and, unless `config.process_jobs` is false, start
    /// processing jobs. Must be called within a tokio runtime.
    pub fn open(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let scheduler = Self::new(store, config)?;
        if scheduler.inner.config.process_jobs {
            scheduler.start_jobs_processing();
        }
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    /// Register the processor for jobs named `name`.
    pub fn define_job(
        &self,
        name: &str,
        processor: Processor,
        options: JobOptions,
    ) -> Result<(), SchedulerError> {
        if let Err(e) = self.inner.registry.define(name, processor, options) {
            self.inner.emit(SchedulerEvent::Error {
                job: None,
                message: e.to_string(),
            });
            return Err(e);
        }
        debug!(name, "defined job");
        Ok(())
    }

    /// Forget every registered processor.
    pub fn clear_job_definitions(&self) {
        self.inner.registry.clear();
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Schedule a one-shot run of `name` with `data`.
    ///
    /// Any finished, pending or abandoned record for the same `(name, data)`
    /// is removed first, so at most one active record exists per pair.
    pub async fn schedule(
        &self,
        when: impl Into<When>,
        name: &str,
        data: Value,
    ) -> Result<JobRecord, SchedulerError> {
        let next_run_at = when.into().resolve(Utc::now())?;
        self.create_job_record(NewJob::once(name, data, next_run_at))
            .await
    }

    /// Schedule a one-shot run of `name` right away.
    pub async fn now(&self, name: &str, data: Value) -> Result<JobRecord, SchedulerError> {
        self.schedule(When::Now, name, data).await
    }

    /// Schedule `name` to run every `interval` (a human-readable interval).
    pub async fn every(
        &self,
        interval: &str,
        name: &str,
        data: Value,
        options: EveryOptions,
    ) -> Result<JobRecord, SchedulerError> {
        let period = parse_human_interval(interval)?;
        if period.is_zero() {
            return Err(SchedulerError::InvalidInterval(interval.to_string()));
        }
        let interval_ms = u64::try_from(period.as_millis())
            .map_err(|_| SchedulerError::InvalidInterval(interval.to_string()))?;

        let now = Utc::now();
        let next_run_at = if options.run_now {
            now
        } else {
            add_duration(now, period)
                .ok_or_else(|| SchedulerError::InvalidInterval(interval.to_string()))?
        };

        self.create_job_record(NewJob::once(name, data, next_run_at).recurring(interval_ms, interval))
            .await
    }

    /// Clear conflicting records for the job's key, then insert it.
    ///
    /// The two steps are not atomic: a crash in between can leave the key
    /// with no active record.
    #[tracing::instrument(skip(self, job), fields(name = %job.name))]
    async fn create_job_record(&self, job: NewJob) -> Result<JobRecord, SchedulerError> {
        self.remove_done_or_scheduled(&job.name, &job.data).await?;
        self.remove_dead(&job.name, &job.data).await?;

        debug!(next_run_at = %job.next_run_at, recurring = job.interval_ms.is_some(), "scheduling job");
        let id = self.inner.store.insert_one(job).await?;

        self.get_job(&id)
            .await?
            .ok_or(SchedulerError::JobNotFound(id))
    }

    // =========================================================================
    // Removal and lookup
    // =========================================================================

    /// Delete every record for `(name, data)` regardless of status.
    pub async fn remove(&self, name: &str, data: &Value) -> Result<u64, SchedulerError> {
        Ok(self
            .inner
            .store
            .delete_many(&JobFilter::by_key(name, data))
            .await?)
    }

    /// Delete failed records for `(name, data)`.
    pub async fn remove_errors(&self, name: &str, data: &Value) -> Result<u64, SchedulerError> {
        let filter = JobFilter::by_key(name, data).status(JobStatus::Error);
        Ok(self.inner.store.delete_many(&filter).await?)
    }

    /// Delete finished or still-pending records for `(name, data)`.
    pub async fn remove_done_or_scheduled(
        &self,
        name: &str,
        data: &Value,
    ) -> Result<u64, SchedulerError> {
        let filter = JobFilter::by_key(name, data)
            .statuses(vec![JobStatus::Done, JobStatus::Scheduled]);
        Ok(self.inner.store.delete_many(&filter).await?)
    }

    /// Delete `processing` records for `(name, data)` whose lease has expired.
    pub async fn remove_dead(&self, name: &str, data: &Value) -> Result<u64, SchedulerError> {
        let filter = JobFilter::by_key(name, data)
            .status(JobStatus::Processing)
            .lock(LockFilter::LockedAtOrBefore(self.lock_deadline(Utc::now())));
        Ok(self.inner.store.delete_many(&filter).await?)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>, SchedulerError> {
        Ok(self.inner.store.find_one(&JobFilter::by_id(id)).await?)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, SchedulerError> {
        Ok(self.inner.store.find_many(filter).await?)
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    fn lock_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        sub_duration(now, self.inner.config.lock_lifetime)
    }

    /// Upper bound on `next_run_at` for claims: the next scan time cached by
    /// the scan loop, or now when the loop is not running.
    fn scan_horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.inner.scan_state().next_scan_at.unwrap_or(now)
    }

    /// Atomically take the lease on one eligible job.
    ///
    /// Eligible means: scheduled or processing, due by the scan horizon, not
    /// leased (or leased longer ago than `lock_lifetime`), and of a name this
    /// scheduler has a processor for.
    pub async fn claim_next_job(&self) -> Result<Option<JobRecord>, SchedulerError> {
        let names = self.inner.registry.names();
        if names.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let filter = JobFilter::new()
            .statuses(vec![JobStatus::Scheduled, JobStatus::Processing])
            .next_run_at_lte(self.scan_horizon(now))
            .lock(LockFilter::UnlockedOrExpired {
                deadline: self.lock_deadline(now),
            })
            .names(names);
        let update = JobUpdate::new()
            .status(JobStatus::Processing)
            .locked_at(Some(now))
            .worker_id(Some(self.inner.config.worker_id.clone()));

        Ok(self.inner.store.find_one_and_update(&filter, &update).await?)
    }

    /// Claim up to `concurrency` jobs at once.
    ///
    /// All claim attempts run concurrently; empty results are dropped, and a
    /// failed attempt only costs its own slot.
    pub async fn claim_batch(&self) -> Vec<JobRecord> {
        let attempts = (0..self.inner.config.concurrency).map(|_| self.claim_next_job());

        let mut batch = Vec::new();
        for result in join_all(attempts).await {
            match result {
                Ok(Some(job)) => batch.push(job),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "claim attempt failed, dropping it from the batch");
                    self.inner.emit(SchedulerEvent::Error {
                        job: None,
                        message: e.to_string(),
                    });
                }
            }
        }
        batch
    }

    /// Run one scan tick: claim a batch and start every job in it.
    ///
    /// Returns once the jobs are started; it does not wait for them.
    pub async fn process_jobs(&self) -> usize {
        let batch = self.claim_batch().await;
        debug!(count = batch.len(), "claimed batch");

        let count = batch.len();
        for job in batch {
            let span = info_span!("job", job.id = %job.id, job.name = %job.name);
            tokio::spawn(supervisor::supervise(Arc::clone(&self.inner), job).instrument(span));
        }
        count
    }

    // =========================================================================
    // Scan loop
    // =========================================================================

    /// Arm the scan loop. Does nothing if it is already running.
    pub fn start_jobs_processing(&self) {
        let mut state = self.inner.scan_state();
        if state.handle.is_some() {
            debug!("jobs processing already running");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.clone().scan_loop(stop_rx));
        state.handle = Some(ScanHandle {
            stop_tx,
            _task: task,
        });
        info!(worker_id = %self.inner.config.worker_id, "jobs processing started");
    }

    /// Disarm the scan loop. Jobs already started keep running, and a tick
    /// already claiming finishes its batch. Does nothing if not running.
    pub fn stop_jobs_processing(&self) {
        let mut state = self.inner.scan_state();
        state.next_scan_at = None;
        if let Some(handle) = state.handle.take() {
            let _ = handle.stop_tx.send(true);
            info!(worker_id = %self.inner.config.worker_id, "jobs processing stopped");
        }
    }

    /// Whether the scan loop is armed.
    pub fn is_processing(&self) -> bool {
        self.inner.scan_state().handle.is_some()
    }

    /// When the next scan tick is due, or `None` when the loop is stopped.
    pub fn next_scan_at(&self) -> Option<DateTime<Utc>> {
        self.inner.scan_state().next_scan_at
    }

    /// Stop processing jobs. The store itself is owned by the caller.
    pub fn close(&self) {
        self.stop_jobs_processing();
    }

    async fn scan_loop(self, mut stop_rx: watch::Receiver<bool>) {
        let interval = self.inner.config.scan_interval;

        loop {
            {
                // Checked under the same lock stop_jobs_processing takes, so a
                // stop can never be followed by a fresh next_scan_at.
                let mut state = self.inner.scan_state();
                if *stop_rx.borrow() {
                    break;
                }
                state.next_scan_at = add_duration(Utc::now(), interval);
            }

            tokio::select! {
                biased;

                _ = stop_rx.changed() => break,
                _ = sleep(interval) => {}
            }

            let count = self.process_jobs().await;
            if count > 0 {
                debug!(count, "dispatched jobs");
            }
        }

        debug!("scan loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_store::MemoryStore;
    use serde_json::json;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(MemoryStore::new()), SchedulerConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Scheduler::new(
            Arc::new(MemoryStore::new()),
            SchedulerConfig::default().concurrency(0),
        )
        .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_duplicate_definition_is_emitted_and_returned() {
        let scheduler = scheduler();
        let mut events = scheduler.subscribe();
        let noop = || Processor::new(|_| async { Ok(()) });

        scheduler.define_job("a", noop(), JobOptions::new()).unwrap();
        let err = scheduler
            .define_job("a", noop(), JobOptions::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateDefinition(_)));

        match events.recv().await.unwrap() {
            SchedulerEvent::Error { job, message } => {
                assert!(job.is_none());
                assert!(message.contains("already exists"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_claim_without_definitions_finds_nothing() {
        let scheduler = scheduler();
        scheduler.now("orphan", json!({})).await.unwrap();
        assert!(scheduler.claim_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_every_rejects_zero_interval() {
        let err = scheduler()
            .every("0 seconds", "tick", json!({}), EveryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInterval(_)));
    }

    #[tokio::test]
    async fn test_open_respects_process_jobs() {
        let manage_only = Scheduler::open(
            Arc::new(MemoryStore::new()),
            SchedulerConfig::default().process_jobs(false),
        )
        .unwrap();
        assert!(!manage_only.is_processing());

        let worker =
            Scheduler::open(Arc::new(MemoryStore::new()), SchedulerConfig::default()).unwrap();
        assert!(worker.is_processing());
        worker.close();
        assert!(!worker.is_processing());
    }
}
