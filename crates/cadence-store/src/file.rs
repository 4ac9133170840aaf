//! Job store persisted as a JSON file shared between processes.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fd_lock::RwLock as FileLock;
use tracing::{debug, info};

use crate::memory::{delete, find_and_update, insert};
use crate::{JobFilter, JobId, JobRecord, JobStore, JobUpdate, NewJob, StoreError};

/// A job store backed by a JSON file.
///
/// Nothing is cached between calls. Every operation takes an OS lock on a
/// sidecar `<path>.lock` file, reads the records from disk, and for mutations
/// writes them back before releasing the lock. Any number of `FileStore`s, in
/// this process or others, can share one path: inserts from all of them are
/// kept and a conditional update is only ever won by one caller.
///
/// The data file is replaced atomically (write to a temp file in the same
/// directory, then rename), so a failed write leaves the previous contents in
/// place and the operation reports the error without having taken effect.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    /// Open the store at `path`, checking existing records if the file exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            lock_path: lock_path_for(&path),
            path,
        };

        let count = store.read(|jobs| jobs.len()).await?;
        info!(path = %store.path.display(), count, "opened job store");
        Ok(store)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` over the stored records under a shared lock.
    async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&[JobRecord]) -> T + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let lock = FileLock::new(open_lock_file(&lock_path)?);
            let _guard = lock.read()?;
            let records = load(&path)?;
            Ok(f(&records))
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Run `f` over the stored records under an exclusive lock. When `f`
    /// reports a change the records are written back before the lock is
    /// released; if that write fails the file is left as it was.
    async fn modify<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Vec<JobRecord>) -> (T, bool) + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut lock = FileLock::new(open_lock_file(&lock_path)?);
            let _guard = lock.write()?;
            let mut records = load(&path)?;
            let (out, changed) = f(&mut records);
            if changed {
                write_atomically(&path, &serde_json::to_vec_pretty(&records)?)?;
                debug!(path = %path.display(), count = records.len(), "persisted job store");
            }
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn open_lock_file(lock_path: &Path) -> Result<File, StoreError> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?)
}

/// Read and validate the records at `path`. A missing or empty file is an
/// empty store.
fn load(path: &Path) -> Result<Vec<JobRecord>, StoreError> {
    let records: Vec<JobRecord> = match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Vec::new(),
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut seen = HashSet::new();
    for record in &records {
        if !seen.insert(&record.id) {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("duplicate job id {}", record.id),
            });
        }
    }
    Ok(records)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl JobStore for FileStore {
    async fn insert_one(&self, job: NewJob) -> Result<JobId, StoreError> {
        self.modify(move |jobs| (insert(jobs, job), true)).await
    }

    async fn find_one(&self, filter: &JobFilter) -> Result<Option<JobRecord>, StoreError> {
        let filter = filter.clone();
        self.read(move |jobs| jobs.iter().find(|j| filter.matches(j)).cloned())
            .await
    }

    async fn find_many(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let filter = filter.clone();
        self.read(move |jobs| jobs.iter().filter(|j| filter.matches(j)).cloned().collect())
            .await
    }

    async fn find_one_and_update(
        &self,
        filter: &JobFilter,
        update: &JobUpdate,
    ) -> Result<Option<JobRecord>, StoreError> {
        let (filter, update) = (filter.clone(), update.clone());
        self.modify(move |jobs| {
            let updated = find_and_update(jobs, &filter, &update);
            let changed = updated.is_some();
            (updated, changed)
        })
        .await
    }

    async fn update_one(&self, filter: &JobFilter, update: &JobUpdate) -> Result<bool, StoreError> {
        let (filter, update) = (filter.clone(), update.clone());
        self.modify(move |jobs| {
            let matched = find_and_update(jobs, &filter, &update).is_some();
            (matched, matched)
        })
        .await
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let filter = filter.clone();
        self.modify(move |jobs| {
            let deleted = delete(jobs, &filter);
            (deleted, deleted > 0)
        })
        .await
    }
}
