//! Stage-aware progress reporting.
//!
//! Each generation stage owns a fixed slice of the 0-100 range. A
//! [`ProgressReporter`] turns "stage X is half done" into an overall
//! percentage, never lets it move backwards, and forwards it to a
//! [`ProgressSink`] (the local task table or the distributed status store).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TaskError};
use crate::task::{GenerationTask, TaskId, TaskStatus};

/// One step of the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Decode and filter the image.
    Decode,
    /// Normalise into a heightmap.
    Heightmap,
    /// Build the substrate outline.
    Outline,
    /// Place the heightmap on the outline.
    Fit,
    /// Build the triangle solid.
    MeshBuild,
    /// Serialize and store the STL.
    Persist,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Self; 6] = [
        Self::Decode,
        Self::Heightmap,
        Self::Outline,
        Self::Fit,
        Self::MeshBuild,
        Self::Persist,
    ];

    /// Progress percentage at which the stage begins and ends.
    #[must_use]
    pub const fn range(self) -> (u8, u8) {
        match self {
            Self::Decode => (0, 10),
            Self::Heightmap => (10, 30),
            Self::Outline => (30, 40),
            Self::Fit => (40, 60),
            Self::MeshBuild => (60, 90),
            Self::Persist => (90, 100),
        }
    }

    /// Failure category for errors raised inside this stage.
    #[must_use]
    pub const fn failure_kind(self) -> ErrorKind {
        match self {
            Self::Decode => ErrorKind::Decode,
            Self::Heightmap | Self::Fit => ErrorKind::Geometry,
            Self::Outline => ErrorKind::Validation,
            Self::MeshBuild => ErrorKind::MeshBuild,
            Self::Persist => ErrorKind::Storage,
        }
    }

    /// Short status message shown while the stage runs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Decode => "decoding image",
            Self::Heightmap => "building heightmap",
            Self::Outline => "computing outline",
            Self::Fit => "fitting relief",
            Self::MeshBuild => "building mesh",
            Self::Persist => "writing STL",
        }
    }

    /// Overall percentage `fraction` of the way through this stage.
    #[must_use]
    pub fn at(self, fraction: f64) -> u8 {
        let (start, end) = self.range();
        let span = f64::from(end - start);
        let offset = (span * fraction.clamp(0.0, 1.0)).round();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let offset = offset as u8;
        start + offset
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Decode => "decode",
            Self::Heightmap => "heightmap",
            Self::Outline => "outline",
            Self::Fit => "fit",
            Self::MeshBuild => "mesh_build",
            Self::Persist => "persist",
        };
        f.write_str(s)
    }
}

/// A single progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Stage the task is in.
    pub stage: Stage,
    /// Overall percentage, `0..=100`.
    pub progress: u8,
    /// Status message.
    pub message: String,
}

/// Where progress events go, and where cancellation requests come from.
pub trait ProgressSink: Send + Sync {
    /// Record a progress event for `task_id`.
    fn publish(&self, task_id: TaskId, update: ProgressUpdate);

    /// Whether cancellation has been requested for `task_id`.
    fn cancel_requested(&self, task_id: TaskId) -> bool;
}

/// Per-task progress front end used by the generation runner.
pub struct ProgressReporter<'a> {
    task_id: TaskId,
    sink: &'a dyn ProgressSink,
    last: AtomicU8,
}

impl<'a> ProgressReporter<'a> {
    /// Report progress for `task_id` into `sink`.
    pub fn new(task_id: TaskId, sink: &'a dyn ProgressSink) -> Self {
        Self {
            task_id,
            sink,
            last: AtomicU8::new(0),
        }
    }

    /// The task being reported on.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Announce that `stage` has started.
    pub fn begin(&self, stage: Stage) {
        self.report(stage, 0.0, stage.message());
    }

    /// Announce that `stage` has finished.
    pub fn finish(&self, stage: Stage) {
        self.report(stage, 1.0, stage.message());
    }

    /// Report `fraction` of `stage` done. Values that would move the
    /// overall percentage backwards are raised to the last reported value.
    pub fn report(&self, stage: Stage, fraction: f64, message: &str) {
        let wanted = stage.at(fraction).min(100);
        let progress = self.last.fetch_max(wanted, Ordering::AcqRel).max(wanted);
        tracing::debug!(task_id = %self.task_id, %stage, progress, "progress");
        self.sink.publish(
            self.task_id,
            ProgressUpdate {
                stage,
                progress,
                message: message.to_string(),
            },
        );
    }

    /// Highest percentage reported so far.
    #[must_use]
    pub fn last(&self) -> u8 {
        self.last.load(Ordering::Acquire)
    }

    /// Whether the caller asked for this task to stop.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.sink.cancel_requested(self.task_id)
    }
}

/// Polling view of a task, suitable for a status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Task id.
    pub task_id: TaskId,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Overall percentage.
    pub progress: u8,
    /// Current or last stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Status message.
    pub message: String,
    /// Failure, present only for FAILED tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl From<&GenerationTask> for ProgressRecord {
    fn from(task: &GenerationTask) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            progress: task.progress,
            stage: task.stage,
            message: task.message.clone(),
            error: task.error.clone(),
            updated_at: task.updated_at,
        }
    }
}
