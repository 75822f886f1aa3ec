//! The task-queue contract shared by every scheduling backend.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, SweepReport};
use crate::error::QueueError;
use crate::task::{GenerationJob, GenerationTask, TaskId, TaskStatus};

/// Which backend is serving the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    /// In-process thread pool.
    #[default]
    Local,
    /// Spool broker plus external worker processes.
    Distributed,
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Distributed => f.write_str("distributed"),
        }
    }
}

impl FromStr for QueueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "distributed" => Ok(Self::Distributed),
            other => Err(format!("unknown queue type {other:?} (expected local or distributed)")),
        }
    }
}

/// Introspection snapshot of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Backend in use; the only observable difference between backends.
    pub queue_type: QueueType,
    /// Whether the backend accepts work.
    pub is_running: bool,
    /// Configured concurrency.
    pub max_workers: usize,
    /// Tasks currently tracked.
    pub total: usize,
    /// Tasks waiting for a worker.
    pub pending: usize,
    /// Tasks executing.
    pub running: usize,
    /// Tasks completed.
    pub completed: usize,
    /// Tasks failed.
    pub failed: usize,
    /// Tasks cancelled.
    pub cancelled: usize,
}

impl QueueStats {
    /// Empty stats for a backend.
    #[must_use]
    pub const fn new(queue_type: QueueType, is_running: bool, max_workers: usize) -> Self {
        Self {
            queue_type,
            is_running,
            max_workers,
            total: 0,
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
        }
    }

    /// Count one task.
    pub const fn count(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Tasks not yet terminal.
    #[must_use]
    pub const fn active(&self) -> usize {
        self.pending + self.running
    }
}

/// Submission and polling interface for generation jobs.
///
/// Both backends honour the same contract:
///
/// - `submit` validates synchronously and never waits for execution;
///   a rejected job creates no task.
/// - `status` and `result` fail with [`QueueError::NotFound`] for unknown
///   ids and for completed tasks whose artifact has expired.
/// - `cancel` returns `true` for a PENDING task (now CANCELLED) or a
///   RUNNING one (flagged; it stops at the next stage boundary) and
///   `false` for a terminal one.
pub trait TaskQueue: Send + Sync {
    /// Enqueue a job and return its id; the task starts PENDING.
    ///
    /// # Errors
    ///
    /// [`QueueError::Validation`] for a bad job, [`QueueError::Stopped`]
    /// after shutdown, or a storage/broker error.
    fn submit(&self, job: GenerationJob) -> Result<TaskId, QueueError>;

    /// Current snapshot of a task.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotFound`] for unknown or expired tasks.
    fn status(&self, id: TaskId) -> Result<GenerationTask, QueueError>;

    /// Request cancellation.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotFound`] for unknown tasks.
    fn cancel(&self, id: TaskId) -> Result<bool, QueueError>;

    /// Fetch a completed task's artifact.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotReady`] unless COMPLETED; [`QueueError::NotFound`]
    /// once expired or evicted.
    fn result(&self, id: TaskId) -> Result<Artifact, QueueError>;

    /// Queue statistics.
    fn introspect(&self) -> QueueStats;

    /// Whether the backend is up.
    fn health(&self) -> bool {
        self.introspect().is_running
    }

    /// Delete expired artifacts and evict expired task records.
    ///
    /// # Errors
    ///
    /// Storage errors while listing or deleting.
    fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, QueueError>;

    /// Stop accepting work and release background resources.
    fn shutdown(&self);
}
