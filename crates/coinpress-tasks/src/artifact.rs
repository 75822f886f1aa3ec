//! Temp-file artifact storage with time-based expiry.
//!
//! Each artifact is `<task-id>.stl` plus a `<task-id>.json` sidecar holding
//! its [`ArtifactRef`]. Files are written under a temporary name and
//! renamed into place, so a reader never opens a partial file.
//!
//! Reads and the expiry sweep coordinate through per-artifact leases: the
//! sweep skips anything currently being read in this process. A reader
//! in another process opens the file before reading it, and an unlinked
//! file stays readable through an open handle, so a concurrent delete
//! cannot truncate a download in flight.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::task::TaskId;

/// Handle to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Owning task.
    pub task_id: TaskId,
    /// File name inside the store directory.
    pub file_name: String,
    /// Size of the STL in bytes.
    pub size_bytes: u64,
    /// When it was written.
    pub created_at: DateTime<Utc>,
    /// When the sweep may delete it.
    pub expires_at: DateTime<Utc>,
}

/// A fetched artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Where it came from.
    pub reference: ArtifactRef,
    /// The STL bytes.
    pub bytes: Vec<u8>,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Artifacts deleted.
    pub artifacts_removed: usize,
    /// Expired artifacts left in place because a read was in flight.
    pub artifacts_in_use: usize,
    /// Task records evicted by the scheduler.
    pub tasks_evicted: usize,
}

/// Directory-backed artifact store.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    ttl: Duration,
    leases: Mutex<HashMap<TaskId, usize>>,
}

/// Releases a read lease on drop.
struct Lease<'a> {
    store: &'a ArtifactStore,
    task_id: TaskId,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut leases = self.store.leases.lock();
        if let Some(count) = leases.get_mut(&self.task_id) {
            *count -= 1;
            if *count == 0 {
                leases.remove(&self.task_id);
            }
        }
    }
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `dir` whose artifacts
    /// live for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            ttl,
            leases: Mutex::new(HashMap::new()),
        })
    }

    /// Store root.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Artifact lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    fn stl_path(&self, task_id: TaskId) -> PathBuf {
        self.dir.join(format!("{task_id}.stl"))
    }

    fn meta_path(&self, task_id: TaskId) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    fn lease(&self, task_id: TaskId) -> Lease<'_> {
        *self.leases.lock().entry(task_id).or_insert(0) += 1;
        Lease {
            store: self,
            task_id,
        }
    }

    fn in_use(&self, task_id: TaskId) -> bool {
        self.leases.lock().contains_key(&task_id)
    }

    /// Persist `bytes` for `task_id`, expiring `ttl` after `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if writing fails; nothing is left behind.
    pub fn put(
        &self,
        task_id: TaskId,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<ArtifactRef, StorageError> {
        let reference = ArtifactRef {
            task_id,
            file_name: format!("{task_id}.stl"),
            size_bytes: bytes.len() as u64,
            created_at: now,
            expires_at: now + self.ttl,
        };
        let stl = self.stl_path(task_id);
        let meta = self.meta_path(task_id);
        let result = write_atomic(&stl, bytes)
            .and_then(|()| write_atomic(&meta, &serde_json::to_vec_pretty(&reference)?));
        if let Err(err) = result {
            remove_if_exists(&stl).ok();
            remove_if_exists(&meta).ok();
            return Err(err);
        }
        debug!(%task_id, size = bytes.len(), expires_at = %reference.expires_at, "stored artifact");
        Ok(reference)
    }

    /// Read an artifact.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if it has expired at `now` or has
    /// already been deleted.
    pub fn get(&self, reference: &ArtifactRef, now: DateTime<Utc>) -> Result<Vec<u8>, StorageError> {
        let not_found = || StorageError::NotFound(format!("artifact for task {}", reference.task_id));
        if reference.expires_at <= now {
            return Err(not_found());
        }
        let _lease = self.lease(reference.task_id);
        let mut file = match fs::File::open(self.dir.join(&reference.file_name)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(err) => return Err(err.into()),
        };
        let mut bytes = Vec::with_capacity(usize::try_from(reference.size_bytes).unwrap_or(0));
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Whether the artifact is still on disk and unexpired at `now`.
    #[must_use]
    pub fn exists(&self, reference: &ArtifactRef, now: DateTime<Utc>) -> bool {
        reference.expires_at > now && self.dir.join(&reference.file_name).is_file()
    }

    /// Delete an artifact now.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] for failures other than "already gone".
    pub fn remove(&self, task_id: TaskId) -> Result<(), StorageError> {
        remove_if_exists(&self.stl_path(task_id))?;
        remove_if_exists(&self.meta_path(task_id))?;
        Ok(())
    }

    /// Delete every artifact whose `expires_at <= now`, skipping those
    /// with a read in flight.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be listed.
    /// Individual unreadable sidecars are logged and skipped.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StorageError> {
        let mut report = SweepReport::default();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let reference: ArtifactRef = match fs::read(&path)
                .map_err(StorageError::from)
                .and_then(|raw| Ok(serde_json::from_slice(&raw)?))
            {
                Ok(reference) => reference,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable artifact sidecar");
                    continue;
                }
            };
            if reference.expires_at > now {
                continue;
            }
            if self.in_use(reference.task_id) {
                report.artifacts_in_use += 1;
                continue;
            }
            self.remove(reference.task_id)?;
            report.artifacts_removed += 1;
        }
        if report.artifacts_removed > 0 || report.artifacts_in_use > 0 {
            info!(
                removed = report.artifacts_removed,
                in_use = report.artifacts_in_use,
                "artifact sweep"
            );
        }
        Ok(report)
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    if let Err(err) = fs::rename(&tmp, path) {
        remove_if_exists(&tmp).ok();
        return Err(err.into());
    }
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
