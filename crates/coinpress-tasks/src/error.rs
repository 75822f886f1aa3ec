//! Error taxonomy for task scheduling and storage.

use std::fmt;

use coinpress_pipeline::PipelineError;
use serde::{Deserialize, Serialize};

use crate::task::{TaskId, TaskStatus};

/// Category of a task failure, carried on FAILED tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad parameters or input.
    Validation,
    /// The image could not be decoded.
    Decode,
    /// Degenerate heightmap, outline, or placement.
    Geometry,
    /// The mesh builder failed.
    MeshBuild,
    /// A worker stopped reporting and was presumed dead.
    Timeout,
    /// Artifact persistence failed.
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Decode => "decode",
            Self::Geometry => "geometry",
            Self::MeshBuild => "mesh_build",
            Self::Timeout => "timeout",
            Self::Storage => "storage",
        };
        f.write_str(s)
    }
}

impl From<&PipelineError> for ErrorKind {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::EmptyInput
            | PipelineError::ImageDecode(_)
            | PipelineError::MalformedRaw(_) => Self::Decode,
            PipelineError::InvalidParameters(_) => Self::Validation,
            PipelineError::Geometry(_) => Self::Geometry,
            PipelineError::MeshBuild(_) => Self::MeshBuild,
        }
    }
}

/// The failure recorded on a FAILED task.
///
/// Plain data so it survives the trip through the distributed status
/// store unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl TaskError {
    /// Create a task error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors from the artifact store and the distributed status store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record could not be (de)serialized.
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    /// The requested item does not exist or has expired.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record lock could not be acquired in time.
    #[error("record locked: {0}")]
    Locked(String),
}

/// Errors returned by [`TaskQueue`](crate::TaskQueue) operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The job was rejected before a task was created.
    #[error("invalid job: {0}")]
    Validation(String),

    /// Unknown task id, or the task's artifact has expired.
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// The task has not completed.
    #[error("task is {status}, not completed")]
    NotReady {
        /// Current status.
        status: TaskStatus,
    },

    /// Artifact or status storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The message broker rejected the job.
    #[error("broker error: {0}")]
    Broker(String),

    /// The scheduler could not start its workers or background threads.
    #[error("failed to start scheduler: {0}")]
    Startup(String),

    /// The scheduler has been shut down.
    #[error("scheduler is not running")]
    Stopped,
}

/// An illegal state-machine transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {transition} a task that is {from}")]
pub struct InvalidTransition {
    /// Status the task was in.
    pub from: TaskStatus,
    /// Name of the rejected transition.
    pub transition: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_map_to_kinds() {
        assert_eq!(
            ErrorKind::from(&PipelineError::EmptyInput),
            ErrorKind::Decode
        );
        assert_eq!(
            ErrorKind::from(&PipelineError::Geometry(String::new())),
            ErrorKind::Geometry
        );
        assert_eq!(
            ErrorKind::from(&PipelineError::InvalidParameters(String::new())),
            ErrorKind::Validation
        );
        assert_eq!(
            ErrorKind::from(&PipelineError::MeshBuild(String::new())),
            ErrorKind::MeshBuild
        );
    }

    #[test]
    fn task_error_display() {
        let err = TaskError::new(ErrorKind::Timeout, "worker went quiet");
        assert_eq!(err.to_string(), "timeout: worker went quiet");
    }

    #[test]
    fn not_ready_display() {
        let err = QueueError::NotReady {
            status: TaskStatus::Running,
        };
        assert_eq!(err.to_string(), "task is running, not completed");
    }
}
