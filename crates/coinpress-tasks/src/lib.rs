//! coinpress-tasks: asynchronous execution of relief-coin generation jobs.
//!
//! A [`TaskQueue`] accepts [`GenerationJob`]s and tracks each as a
//! [`GenerationTask`] through PENDING, RUNNING and a terminal state. Two
//! interchangeable backends implement it:
//!
//! - [`LocalScheduler`]: a bounded in-process thread pool.
//! - [`DistributedScheduler`]: a spool-directory broker consumed by
//!   separate [`Worker`] processes, with a filesystem status store as the
//!   shared source of truth.
//!
//! Both run the same [`GenerationRunner`], which drives the staged
//! pipeline, reports progress, honours cancellation at stage boundaries,
//! and stores the STL in an [`ArtifactStore`] that expires it after a TTL.

pub mod artifact;
pub mod config;
pub mod distributed;
pub mod error;
pub mod housekeeping;
pub mod local;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod task;

pub use artifact::{Artifact, ArtifactRef, ArtifactStore, SweepReport};
pub use config::{MeshSettings, Settings, SettingsError};
pub use distributed::{DistributedScheduler, Worker};
pub use error::{ErrorKind, QueueError, StorageError, TaskError};
pub use local::LocalScheduler;
pub use progress::{ProgressRecord, ProgressReporter, ProgressSink, ProgressUpdate, Stage};
pub use queue::{QueueStats, QueueType, TaskQueue};
pub use runner::{GenerationRunner, Outcome};
pub use task::{GenerationJob, GenerationTask, TaskId, TaskStatus, Transition};

/// Start the backend selected by `settings.queue_type`.
///
/// # Errors
///
/// Returns [`QueueError`] if the backend cannot start.
pub fn build_queue(settings: &Settings) -> Result<Box<dyn TaskQueue>, QueueError> {
    Ok(match settings.queue_type {
        QueueType::Local => Box::new(LocalScheduler::start(settings)?),
        QueueType::Distributed => Box::new(DistributedScheduler::start(settings)?),
    })
}
