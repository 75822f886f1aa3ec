//! Spool-directory message broker.
//!
//! ```text
//! <root>/queue/<enqueued-millis>-<task-id>.json    waiting message
//! <root>/claimed/<enqueued-millis>-<task-id>.json  message owned by a worker
//! <root>/payload/<task-id>.bin                     image bytes
//! ```
//!
//! Publishing writes the payload first and then renames the message into
//! `queue/`, so a visible message always has its payload. Claiming is a
//! rename from `queue/` to `claimed/`; exactly one worker wins and the
//! rest see `NotFound` and move on. Names sort by enqueue time, giving
//! roughly FIFO delivery.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use coinpress_pipeline::{CoinParameters, FilterSettings, ImageSource};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::{remove_if_exists, write_atomic};
use crate::error::StorageError;
use crate::task::{GenerationJob, TaskId};

/// How the payload bytes are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadKind {
    /// An encoded image file.
    Encoded,
    /// Raw 8-bit luminance.
    Raw {
        /// Pixel columns.
        width: u32,
        /// Pixel rows.
        height: u32,
    },
}

/// Queue message for one job; the image travels in a separate payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Task the job belongs to.
    pub task_id: TaskId,
    /// Coin parameters, already validated.
    pub params: CoinParameters,
    /// Optional pixel filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterSettings>,
    /// Payload interpretation.
    pub payload: PayloadKind,
    /// Publish time.
    pub enqueued_at: DateTime<Utc>,
}

/// A message taken off the queue by one worker.
#[derive(Debug)]
pub struct Claimed {
    /// The message.
    pub message: JobMessage,
    /// The reassembled job.
    pub job: GenerationJob,
    path: PathBuf,
}

/// Filesystem broker shared by the submitting process and every worker.
#[derive(Debug, Clone)]
pub struct SpoolBroker {
    queue: PathBuf,
    claimed: PathBuf,
    payload: PathBuf,
}

impl SpoolBroker {
    /// Open (creating if needed) a broker under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directories cannot be created.
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        let broker = Self {
            queue: root.join("queue"),
            claimed: root.join("claimed"),
            payload: root.join("payload"),
        };
        for dir in [&broker.queue, &broker.claimed, &broker.payload] {
            fs::create_dir_all(dir)?;
        }
        Ok(broker)
    }

    fn payload_path(&self, task_id: TaskId) -> PathBuf {
        self.payload.join(format!("{task_id}.bin"))
    }

    /// Enqueue `job` for `task_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if either file cannot be written; nothing
    /// is left behind on failure.
    pub fn publish(
        &self,
        task_id: TaskId,
        job: &GenerationJob,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let payload = match &job.source {
            ImageSource::Encoded { .. } => PayloadKind::Encoded,
            ImageSource::Raw { width, height, .. } => PayloadKind::Raw {
                width: *width,
                height: *height,
            },
        };
        let message = JobMessage {
            task_id,
            params: job.params,
            filter: job.filter,
            payload,
            enqueued_at: now,
        };
        let payload_path = self.payload_path(task_id);
        write_atomic(&payload_path, job.source.as_bytes())?;

        let name = format!("{:020}-{task_id}.json", now.timestamp_millis().max(0));
        let result = serde_json::to_vec(&message)
            .map_err(StorageError::from)
            .and_then(|raw| write_atomic(&self.queue.join(name), &raw));
        if let Err(err) = result {
            remove_if_exists(&payload_path).ok();
            return Err(err);
        }
        debug!(%task_id, "job published");
        Ok(())
    }

    /// Take the oldest waiting message, if any.
    ///
    /// Messages whose payload has vanished or that do not parse are moved
    /// aside and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the queue cannot be listed.
    pub fn claim(&self) -> Result<Option<Claimed>, StorageError> {
        let mut names: Vec<PathBuf> = fs::read_dir(&self.queue)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        names.sort();

        for path in names {
            let Some(file_name) = path.file_name() else {
                continue;
            };
            let target = self.claimed.join(file_name);
            match fs::rename(&path, &target) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
            match self.load(&target) {
                Ok((message, job)) => {
                    debug!(task_id = %message.task_id, "job claimed");
                    return Ok(Some(Claimed {
                        message,
                        job,
                        path: target,
                    }));
                }
                Err(err) => {
                    tracing::warn!(path = %target.display(), error = %err, "dropping unreadable message");
                    remove_if_exists(&target).ok();
                }
            }
        }
        Ok(None)
    }

    fn load(&self, path: &Path) -> Result<(JobMessage, GenerationJob), StorageError> {
        let message: JobMessage = serde_json::from_slice(&fs::read(path)?)?;
        let bytes = fs::read(self.payload_path(message.task_id))?;
        let source = match message.payload {
            PayloadKind::Encoded => ImageSource::encoded(bytes),
            PayloadKind::Raw { width, height } => ImageSource::Raw {
                width,
                height,
                pixels: bytes,
            },
        };
        let job = GenerationJob {
            source,
            params: message.params,
            filter: message.filter,
        };
        Ok((message, job))
    }

    /// Acknowledge a claimed message, deleting it and its payload.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if deletion fails.
    pub fn ack(&self, claimed: &Claimed) -> Result<(), StorageError> {
        remove_if_exists(&claimed.path)?;
        remove_if_exists(&self.payload_path(claimed.message.task_id))
    }

    /// Return a claimed message to the queue untouched so any worker can
    /// take it again.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the rename fails.
    pub fn release(&self, claimed: &Claimed) -> Result<(), StorageError> {
        let Some(file_name) = claimed.path.file_name() else {
            return Ok(());
        };
        fs::rename(&claimed.path, self.queue.join(file_name))?;
        debug!(task_id = %claimed.message.task_id, "job released");
        Ok(())
    }

    /// Delete any claimed message and payload left behind for `task_id`
    /// by a worker that never acknowledged it. Returns whether anything
    /// was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if `claimed/` cannot be listed or a
    /// file cannot be deleted.
    pub fn discard(&self, task_id: TaskId) -> Result<bool, StorageError> {
        let suffix = format!("-{task_id}.json");
        let mut removed = false;
        for entry in fs::read_dir(&self.claimed)?.filter_map(Result::ok) {
            if entry.file_name().to_string_lossy().ends_with(&suffix) {
                remove_if_exists(&entry.path())?;
                removed = true;
            }
        }
        let payload = self.payload_path(task_id);
        if payload.exists() {
            remove_if_exists(&payload)?;
            removed = true;
        }
        Ok(removed)
    }

    /// Messages waiting to be claimed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the queue cannot be listed.
    pub fn pending_count(&self) -> Result<usize, StorageError> {
        Ok(fs::read_dir(&self.queue)?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("json"))
            .count())
    }
}
