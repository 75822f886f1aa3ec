//! Task records and the lifecycle state machine.
//!
//! ```text
//! PENDING ──► RUNNING ──► COMPLETED
//!    │           ├──────► FAILED
//!    │           └──────► CANCELLED
//!    └──────────────────► CANCELLED
//! ```
//!
//! A [`GenerationTask`] is an immutable snapshot. Every change goes
//! through [`GenerationTask::apply`], which returns a new snapshot, so
//! backends can swap whole records atomically and pollers never see a
//! half-updated one.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use coinpress_pipeline::{CoinParameters, Dimensions, FilterSettings, ImageSource};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::ArtifactRef;
use crate::error::{InvalidTransition, QueueError, TaskError};
use crate::progress::Stage;

/// Opaque unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// A fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Accepted, not yet picked up by a worker.
    Pending,
    /// A worker is executing the pipeline.
    Running,
    /// The artifact is available.
    Completed,
    /// A stage failed; see the task's error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// Whether the status can never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Everything a worker needs to generate one coin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    /// Image pixels.
    pub source: ImageSource,
    /// Coin geometry and placement.
    pub params: CoinParameters,
    /// Optional pixel filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterSettings>,
}

impl GenerationJob {
    /// A job with no filter.
    #[must_use]
    pub const fn new(source: ImageSource, params: CoinParameters) -> Self {
        Self {
            source,
            params,
            filter: None,
        }
    }

    /// Attach a pixel filter.
    #[must_use]
    pub fn with_filter(mut self, filter: FilterSettings) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Check everything that can be checked without running the pipeline
    /// and return the job with normalised parameters plus the probed image
    /// size.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Validation`] for bad parameters, an
    /// out-of-range filter, an unreadable image header, or a zero-sized
    /// image.
    pub fn validated(self) -> Result<(Self, Dimensions), QueueError> {
        let params = self
            .params
            .validated()
            .map_err(|e| QueueError::Validation(e.to_string()))?;
        if let Some(filter) = &self.filter {
            filter
                .validate()
                .map_err(|e| QueueError::Validation(e.to_string()))?;
        }
        let dims = self
            .source
            .probe()
            .map_err(|e| QueueError::Validation(e.to_string()))?;
        if dims.is_empty() {
            return Err(QueueError::Validation(format!(
                "image has zero size ({}x{})",
                dims.width, dims.height
            )));
        }
        Ok((Self { params, ..self }, dims))
    }

    /// Content fingerprint of the job.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        coinpress_pipeline::fingerprint(&self.source, &self.params, self.filter.as_ref())
    }
}

/// A requested change to a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// A worker picked the task up.
    Start,
    /// Stage progress while running.
    Progress {
        /// Current stage.
        stage: Stage,
        /// Overall percentage.
        progress: u8,
        /// Status message.
        message: String,
    },
    /// Ask a running task to stop at the next stage boundary.
    RequestCancel,
    /// The artifact was stored.
    Complete(ArtifactRef),
    /// A stage failed.
    Fail(TaskError),
    /// The task stopped without producing an artifact.
    Cancel,
}

impl Transition {
    const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress { .. } => "report progress on",
            Self::RequestCancel => "request cancellation of",
            Self::Complete(_) => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
        }
    }
}

/// Snapshot of one generation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTask {
    /// Task id.
    pub id: TaskId,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Overall percentage, `0..=100`, non-decreasing.
    pub progress: u8,
    /// Current or last stage.
    pub stage: Option<Stage>,
    /// Status message.
    pub message: String,
    /// Present iff `status` is FAILED.
    pub error: Option<TaskError>,
    /// Present iff `status` is COMPLETED.
    pub artifact: Option<ArtifactRef>,
    /// Content fingerprint of the submitted job.
    pub fingerprint: String,
    /// Set when cancellation was requested while running.
    pub cancel_requested: bool,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When a worker started it.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl GenerationTask {
    /// A new PENDING task.
    #[must_use]
    pub fn new(id: TaskId, fingerprint: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            progress: 0,
            stage: None,
            message: "queued".to_string(),
            error: None,
            artifact: None,
            fingerprint,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Apply `transition`, returning the next snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the transition is not allowed from
    /// the current status. Terminal tasks reject everything.
    pub fn apply(
        &self,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidTransition> {
        use TaskStatus::{Cancelled, Completed, Failed, Pending, Running};

        let invalid = InvalidTransition {
            from: self.status,
            transition: transition.name(),
        };
        let mut next = self.clone();
        next.updated_at = now;

        match (self.status, transition) {
            (Pending, Transition::Start) => {
                next.status = Running;
                next.started_at = Some(now);
                next.message = "started".to_string();
            }
            (
                Running,
                Transition::Progress {
                    stage,
                    progress,
                    message,
                },
            ) => {
                next.progress = self.progress.max(progress.min(100));
                next.stage = Some(stage);
                next.message = message;
            }
            (Running, Transition::RequestCancel) => {
                next.cancel_requested = true;
            }
            (Running, Transition::Complete(artifact)) => {
                next.status = Completed;
                next.progress = 100;
                next.message = "completed".to_string();
                next.artifact = Some(artifact);
                next.finished_at = Some(now);
            }
            (Running, Transition::Fail(error)) => {
                next.status = Failed;
                next.message = error.message.clone();
                next.error = Some(error);
                next.finished_at = Some(now);
            }
            (Pending | Running, Transition::Cancel) => {
                next.status = Cancelled;
                next.message = "cancelled".to_string();
                next.finished_at = Some(now);
            }
            _ => return Err(invalid),
        }
        Ok(next)
    }

    /// When this record stops being retrievable.
    ///
    /// Completed tasks live as long as their artifact; failed and
    /// cancelled ones for `retention` after finishing. Live tasks never
    /// expire.
    #[must_use]
    pub fn expires_at(&self, retention: Duration) -> Option<DateTime<Utc>> {
        match (self.status, &self.artifact) {
            (TaskStatus::Completed, Some(artifact)) => Some(artifact.expires_at),
            (status, _) if status.is_terminal() => {
                Some(self.finished_at.unwrap_or(self.updated_at) + retention)
            }
            _ => None,
        }
    }

    /// Whether the record has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.expires_at(retention).is_some_and(|at| at <= now)
    }
}
