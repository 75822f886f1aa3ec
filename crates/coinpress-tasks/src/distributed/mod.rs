//! Broker-backed scheduler for out-of-process workers.
//!
//! The scheduler is a thin client: it writes the initial record to the
//! status store and publishes a message to the broker. Worker processes
//! ([`Worker`]) own execution, and the status store is the single source
//! of truth that both sides read and write. Nothing about a task lives
//! in this process's memory.

pub mod broker;
pub mod store;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use broker::{JobMessage, SpoolBroker};
pub use store::{FileStatusStore, StoreSink};
pub use worker::{Worker, reap};

use crate::artifact::{Artifact, ArtifactStore, SweepReport};
use crate::config::Settings;
use crate::error::{QueueError, StorageError};
use crate::housekeeping::Housekeeper;
use crate::queue::{QueueStats, QueueType, TaskQueue};
use crate::task::{GenerationJob, GenerationTask, TaskId, TaskStatus, Transition};

/// Task queue whose jobs are executed by separate worker processes.
#[derive(Debug)]
pub struct DistributedScheduler {
    broker: SpoolBroker,
    store: FileStatusStore,
    artifacts: Arc<ArtifactStore>,
    retention: Duration,
    delete_on_fetch: bool,
    max_workers: usize,
    running: AtomicBool,
    housekeepers: Mutex<Vec<Housekeeper>>,
}

impl DistributedScheduler {
    /// Connect to the spool named by `settings` and start the background
    /// sweeper and reaper.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if a directory cannot be created, or
    /// [`QueueError::Startup`] if a background thread cannot be spawned.
    pub fn start(settings: &Settings) -> Result<Self, QueueError> {
        let scheduler = Self::connect(settings)?;

        let store = scheduler.store.clone();
        let artifacts = Arc::clone(&scheduler.artifacts);
        let retention = scheduler.retention;
        let sweeper = Housekeeper::spawn("sweeper", settings.sweep_interval(), move || {
            if let Err(err) = sweep_spool(&store, &artifacts, retention, Utc::now()) {
                warn!(error = %err, "background sweep failed");
            }
        })
        .map_err(|e| QueueError::Startup(e.to_string()))?;

        let broker = scheduler.broker.clone();
        let store = scheduler.store.clone();
        let timeout = settings.task_timeout();
        let reaper = Housekeeper::spawn("reaper", settings.reaper_interval(), move || {
            if let Err(err) = reap(&broker, &store, timeout, Utc::now()) {
                warn!(error = %err, "reaper pass failed");
            }
        })
        .map_err(|e| QueueError::Startup(e.to_string()))?;

        scheduler.housekeepers.lock().extend([sweeper, reaper]);
        info!(
            spool = %settings.spool_dir.display(),
            queue = %QueueType::Distributed,
            "scheduler started"
        );
        Ok(scheduler)
    }

    /// Connect without starting background threads; sweeping and reaping
    /// are then left to the caller or to worker processes.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Startup`] if `settings` are invalid, or
    /// [`QueueError::Storage`] if a directory cannot be created.
    pub fn connect(settings: &Settings) -> Result<Self, QueueError> {
        settings
            .validate()
            .map_err(|e| QueueError::Startup(e.to_string()))?;
        Ok(Self {
            broker: SpoolBroker::open(&settings.spool_dir)?,
            store: FileStatusStore::open(&settings.spool_dir)?,
            artifacts: Arc::new(ArtifactStore::open(
                &settings.artifact_dir,
                settings.artifact_ttl(),
            )?),
            retention: settings.artifact_ttl(),
            delete_on_fetch: settings.delete_on_fetch,
            max_workers: settings.max_workers,
            running: AtomicBool::new(true),
            housekeepers: Mutex::new(Vec::new()),
        })
    }

    /// The shared status store.
    #[must_use]
    pub const fn store(&self) -> &FileStatusStore {
        &self.store
    }

    /// Fail RUNNING tasks older than `timeout` at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the store cannot be listed.
    pub fn reap(&self, timeout: Duration, now: DateTime<Utc>) -> Result<usize, QueueError> {
        Ok(reap(&self.broker, &self.store, timeout, now)?)
    }

    fn load(&self, id: TaskId) -> Result<GenerationTask, QueueError> {
        let task = self.store.get(id)?.ok_or(QueueError::NotFound(id))?;
        if task.is_expired(Utc::now(), self.retention) {
            return Err(QueueError::NotFound(id));
        }
        Ok(task)
    }
}

/// Delete expired artifacts, then expired task records.
fn sweep_spool(
    store: &FileStatusStore,
    artifacts: &ArtifactStore,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<SweepReport, StorageError> {
    let mut report = artifacts.sweep(now)?;
    for task in store.list()? {
        if task.is_expired(now, retention) {
            store.remove(task.id)?;
            report.tasks_evicted += 1;
        }
    }
    if report.tasks_evicted > 0 {
        info!(evicted = report.tasks_evicted, queue = %QueueType::Distributed, "evicted expired tasks");
    }
    Ok(report)
}

impl TaskQueue for DistributedScheduler {
    fn submit(&self, job: GenerationJob) -> Result<TaskId, QueueError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }
        let (job, dims) = job.validated()?;
        let id = TaskId::new();
        let now = Utc::now();
        let task = GenerationTask::new(id, job.fingerprint(), now);
        self.store.insert(&task)?;
        if let Err(err) = self.broker.publish(id, &job, now) {
            self.store.remove(id).ok();
            return Err(QueueError::Broker(err.to_string()));
        }
        info!(
            task_id = %id,
            fingerprint = %task.fingerprint,
            width = dims.width,
            height = dims.height,
            queue = %QueueType::Distributed,
            "task submitted"
        );
        Ok(id)
    }

    fn status(&self, id: TaskId) -> Result<GenerationTask, QueueError> {
        self.load(id)
    }

    fn cancel(&self, id: TaskId) -> Result<bool, QueueError> {
        let mut accepted = false;
        let now = Utc::now();
        let task = self
            .store
            .modify(id, |task| {
                let transition = match task.status {
                    TaskStatus::Pending => Transition::Cancel,
                    TaskStatus::Running => Transition::RequestCancel,
                    _ => return None,
                };
                accepted = true;
                task.apply(transition, now).ok()
            })
            .map_err(|err| match err {
                StorageError::NotFound(_) => QueueError::NotFound(id),
                other => QueueError::Storage(other),
            })?;
        if accepted {
            info!(task_id = %id, status = %task.status, "cancellation requested");
        }
        Ok(accepted)
    }

    fn result(&self, id: TaskId) -> Result<Artifact, QueueError> {
        let task = self.load(id)?;
        let reference = match (task.status, task.artifact) {
            (TaskStatus::Completed, Some(reference)) => reference,
            (status, _) => return Err(QueueError::NotReady { status }),
        };
        let bytes = self
            .artifacts
            .get(&reference, Utc::now())
            .map_err(|err| match err {
                StorageError::NotFound(_) => QueueError::NotFound(id),
                other => QueueError::Storage(other),
            })?;
        if self.delete_on_fetch {
            self.artifacts.remove(id)?;
            self.store.remove(id)?;
            debug!(task_id = %id, "artifact deleted after fetch");
        }
        Ok(Artifact { reference, bytes })
    }

    fn introspect(&self) -> QueueStats {
        let mut stats = QueueStats::new(
            QueueType::Distributed,
            self.running.load(Ordering::Acquire),
            self.max_workers,
        );
        match self.store.list() {
            Ok(tasks) => {
                for task in tasks {
                    stats.count(task.status);
                }
            }
            Err(err) => warn!(error = %err, "failed to list task records"),
        }
        stats
    }

    fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, QueueError> {
        Ok(sweep_spool(&self.store, &self.artifacts, self.retention, now)?)
    }

    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut keepers = self.housekeepers.lock();
        if keepers.is_empty() {
            return;
        }
        for mut keeper in keepers.drain(..) {
            keeper.stop();
        }
        info!(queue = %QueueType::Distributed, "scheduler stopped");
    }
}

impl Drop for DistributedScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
