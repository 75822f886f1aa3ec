//! Filesystem status store shared by the scheduler and worker processes.
//!
//! One `<task-id>.json` record per task. Readers load a record without
//! locking: writers replace it by atomic rename, so a read sees either the
//! old or the new snapshot. Writers serialise on a `<task-id>.lock` file
//! created with `create_new`; a lock older than the stale threshold is
//! assumed to belong to a dead process and is broken.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::artifact::{remove_if_exists, write_atomic};
use crate::error::StorageError;
use crate::progress::{ProgressSink, ProgressUpdate};
use crate::task::{GenerationTask, TaskId, TaskStatus, Transition};

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(2);

/// Directory of task records.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    dir: PathBuf,
}

struct RecordLock {
    path: PathBuf,
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(err) = remove_if_exists(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release record lock");
        }
    }
}

impl FileStatusStore {
    /// Open (creating if needed) a store under `root/status`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        let dir = root.join("status");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: TaskId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock(&self, id: TaskId) -> Result<RecordLock, StorageError> {
        let path = self.dir.join(format!("{id}.lock"));
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(RecordLock { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_age(&path).is_some_and(|age| age > LOCK_STALE_AFTER) {
                        warn!(task_id = %id, "breaking stale record lock");
                        remove_if_exists(&path)?;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StorageError::Locked(id.to_string()));
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Write a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the record cannot be written.
    pub fn insert(&self, task: &GenerationTask) -> Result<(), StorageError> {
        let _lock = self.lock(task.id)?;
        write_atomic(&self.record_path(task.id), &serde_json::to_vec_pretty(task)?)
    }

    /// Load a record, or `None` if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the record exists but cannot be read.
    pub fn get(&self, id: TaskId) -> Result<Option<GenerationTask>, StorageError> {
        match fs::read(self.record_path(id)) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Read-modify-write a record under its lock. `f` returns the
    /// replacement, or `None` to leave the record as it is. Returns the
    /// record as stored afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if there is no record,
    /// [`StorageError::Locked`] if the lock cannot be taken in time, or an
    /// I/O error.
    pub fn modify<F>(&self, id: TaskId, f: F) -> Result<GenerationTask, StorageError>
    where
        F: FnOnce(&GenerationTask) -> Option<GenerationTask>,
    {
        let _lock = self.lock(id)?;
        let current = self
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(format!("task {id}")))?;
        match f(&current) {
            Some(next) => {
                write_atomic(&self.record_path(id), &serde_json::to_vec_pretty(&next)?)?;
                Ok(next)
            }
            None => Ok(current),
        }
    }

    /// Apply a state-machine transition. Returns the new record, or `None`
    /// if the transition is not allowed from the stored status.
    ///
    /// # Errors
    ///
    /// As [`FileStatusStore::modify`].
    pub fn transition(
        &self,
        id: TaskId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<GenerationTask>, StorageError> {
        let mut applied = false;
        let task = self.modify(id, |task| match task.apply(transition, now) {
            Ok(next) => {
                applied = true;
                Some(next)
            }
            Err(err) => {
                debug!(task_id = %id, error = %err, "transition rejected");
                None
            }
        })?;
        Ok(applied.then_some(task))
    }

    /// Every readable record. Unreadable ones are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<GenerationTask>, StorageError> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(StorageError::from)
                .and_then(|raw| Ok(serde_json::from_slice::<GenerationTask>(&raw)?));
            match parsed {
                Ok(task) => tasks.push(task),
                // Raced with a removal.
                Err(StorageError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable task record"),
            }
        }
        Ok(tasks)
    }

    /// Delete a record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] for failures other than "already gone".
    pub fn remove(&self, id: TaskId) -> Result<(), StorageError> {
        let _lock = self.lock(id)?;
        remove_if_exists(&self.record_path(id))
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Progress sink that writes through to the status store.
pub struct StoreSink<'a> {
    store: &'a FileStatusStore,
}

impl<'a> StoreSink<'a> {
    /// Report into `store`.
    #[must_use]
    pub const fn new(store: &'a FileStatusStore) -> Self {
        Self { store }
    }
}

impl ProgressSink for StoreSink<'_> {
    fn publish(&self, task_id: TaskId, update: ProgressUpdate) {
        let transition = Transition::Progress {
            stage: update.stage,
            progress: update.progress,
            message: update.message,
        };
        if let Err(err) = self.store.transition(task_id, transition, Utc::now()) {
            warn!(%task_id, error = %err, "failed to record progress");
        }
    }

    /// A vanished record or one already terminal (for example reaped) also
    /// counts as a request to stop.
    fn cancel_requested(&self, task_id: TaskId) -> bool {
        match self.store.get(task_id) {
            Ok(Some(task)) => task.cancel_requested || task.status != TaskStatus::Running,
            Ok(None) => true,
            Err(err) => {
                warn!(%task_id, error = %err, "failed to read cancellation flag");
                false
            }
        }
    }
}
