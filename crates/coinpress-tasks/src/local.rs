//! In-process scheduler backed by a bounded rayon thread pool.
//!
//! The task table maps ids to immutable [`GenerationTask`] snapshots.
//! Writers build the next snapshot with [`GenerationTask::apply`] and
//! swap it in under the write lock; readers clone the `Arc` under the
//! read lock. A poller therefore never sees a half-applied transition.
//! Each task is executed by exactly one pool thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use coinpress_pipeline::MeshBuilder;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactStore, SweepReport};
use crate::config::Settings;
use crate::error::{QueueError, StorageError};
use crate::housekeeping::Housekeeper;
use crate::progress::{ProgressReporter, ProgressSink, ProgressUpdate};
use crate::queue::{QueueStats, QueueType, TaskQueue};
use crate::runner::{GenerationRunner, Outcome};
use crate::task::{GenerationJob, GenerationTask, TaskId, TaskStatus, Transition};

#[derive(Clone)]
struct Entry {
    task: Arc<GenerationTask>,
    cancel: Arc<AtomicBool>,
}

struct Shared {
    tasks: RwLock<HashMap<TaskId, Entry>>,
    runner: GenerationRunner,
    running: AtomicBool,
    in_flight: Mutex<usize>,
    idle: Condvar,
    retention: Duration,
    delete_on_fetch: bool,
    max_workers: usize,
}

/// Decrements the in-flight count when a pool job ends, however it ends.
struct InFlight<'a>(&'a Shared);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut count = self.0.in_flight.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl Shared {
    fn snapshot(&self, id: TaskId) -> Option<Entry> {
        self.tasks.read().get(&id).cloned()
    }

    /// Apply `transition` to the stored record, returning the new snapshot.
    fn transition(&self, id: TaskId, transition: Transition) -> Option<Arc<GenerationTask>> {
        let mut tasks = self.tasks.write();
        let entry = tasks.get_mut(&id)?;
        match entry.task.apply(transition, Utc::now()) {
            Ok(next) => {
                let next = Arc::new(next);
                entry.task = Arc::clone(&next);
                Some(next)
            }
            Err(err) => {
                debug!(task_id = %id, error = %err, "transition rejected");
                None
            }
        }
    }

    fn execute(&self, id: TaskId, job: &GenerationJob) {
        let _guard = InFlight(self);
        if self.transition(id, Transition::Start).is_none() {
            // Cancelled while queued.
            debug!(task_id = %id, "skipping task that is no longer pending");
            return;
        }
        let reporter = ProgressReporter::new(id, self);
        let terminal = match self.runner.run(id, job, &reporter) {
            Outcome::Completed(reference) => Transition::Complete(reference),
            Outcome::Failed(error) => Transition::Fail(error),
            Outcome::Cancelled => Transition::Cancel,
        };
        if let Some(task) = self.transition(id, terminal) {
            info!(task_id = %id, status = %task.status, queue = %QueueType::Local, "task finished");
        }
    }

    fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StorageError> {
        let mut report = self.runner.artifacts().sweep(now)?;
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, entry| !entry.task.is_expired(now, self.retention));
        report.tasks_evicted = before - tasks.len();
        drop(tasks);
        if report.tasks_evicted > 0 {
            info!(evicted = report.tasks_evicted, queue = %QueueType::Local, "evicted expired tasks");
        }
        Ok(report)
    }
}

impl ProgressSink for Shared {
    fn publish(&self, task_id: TaskId, update: ProgressUpdate) {
        self.transition(
            task_id,
            Transition::Progress {
                stage: update.stage,
                progress: update.progress,
                message: update.message,
            },
        );
    }

    fn cancel_requested(&self, task_id: TaskId) -> bool {
        self.snapshot(task_id)
            .is_some_and(|entry| entry.cancel.load(Ordering::Acquire))
    }
}

/// Runs generation jobs on an in-process pool of `max_workers` threads.
pub struct LocalScheduler {
    shared: Arc<Shared>,
    pool: rayon::ThreadPool,
    sweeper: Mutex<Option<Housekeeper>>,
}

impl std::fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("max_workers", &self.shared.max_workers)
            .field("running", &self.shared.running.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl LocalScheduler {
    /// Start a scheduler using the default mesh builder from `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Startup`] if `settings` are invalid or threads
    /// cannot be spawned, or [`QueueError::Storage`] if the artifact
    /// directory cannot be created.
    pub fn start(settings: &Settings) -> Result<Self, QueueError> {
        Self::with_builder(settings, Arc::new(settings.mesh_builder()))
    }

    /// Start a scheduler that builds meshes with `builder`.
    ///
    /// # Errors
    ///
    /// As [`LocalScheduler::start`].
    pub fn with_builder(
        settings: &Settings,
        builder: Arc<dyn MeshBuilder>,
    ) -> Result<Self, QueueError> {
        settings
            .validate()
            .map_err(|e| QueueError::Startup(e.to_string()))?;
        let artifacts = Arc::new(ArtifactStore::open(
            &settings.artifact_dir,
            settings.artifact_ttl(),
        )?);
        let runner = GenerationRunner::new(builder, artifacts, settings.max_heightmap_resolution);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.max_workers)
            .thread_name(|i| format!("coinpress-worker-{i}"))
            .build()
            .map_err(|e| QueueError::Startup(e.to_string()))?;

        let shared = Arc::new(Shared {
            tasks: RwLock::new(HashMap::new()),
            runner,
            running: AtomicBool::new(true),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
            retention: settings.artifact_ttl(),
            delete_on_fetch: settings.delete_on_fetch,
            max_workers: settings.max_workers,
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let sweeper = Housekeeper::spawn("sweeper", settings.sweep_interval(), move || {
            if let Some(shared) = weak.upgrade()
                && let Err(err) = shared.sweep(Utc::now())
            {
                warn!(error = %err, "background sweep failed");
            }
        })
        .map_err(|e| QueueError::Startup(e.to_string()))?;

        info!(
            workers = settings.max_workers,
            artifacts = %settings.artifact_dir.display(),
            queue = %QueueType::Local,
            "scheduler started"
        );
        Ok(Self {
            shared,
            pool,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }
}

impl TaskQueue for LocalScheduler {
    fn submit(&self, job: GenerationJob) -> Result<TaskId, QueueError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }
        let (job, dims) = job.validated()?;
        let id = TaskId::new();
        let task = GenerationTask::new(id, job.fingerprint(), Utc::now());
        info!(
            task_id = %id,
            fingerprint = %task.fingerprint,
            width = dims.width,
            height = dims.height,
            queue = %QueueType::Local,
            "task submitted"
        );
        self.shared.tasks.write().insert(
            id,
            Entry {
                task: Arc::new(task),
                cancel: Arc::new(AtomicBool::new(false)),
            },
        );
        *self.shared.in_flight.lock() += 1;

        let shared = Arc::clone(&self.shared);
        self.pool.spawn(move || shared.execute(id, &job));
        Ok(id)
    }

    fn status(&self, id: TaskId) -> Result<GenerationTask, QueueError> {
        let entry = self.shared.snapshot(id).ok_or(QueueError::NotFound(id))?;
        if entry.task.is_expired(Utc::now(), self.shared.retention) {
            return Err(QueueError::NotFound(id));
        }
        Ok(entry.task.as_ref().clone())
    }

    fn cancel(&self, id: TaskId) -> Result<bool, QueueError> {
        let mut tasks = self.shared.tasks.write();
        let entry = tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        let transition = match entry.task.status {
            TaskStatus::Pending => Transition::Cancel,
            TaskStatus::Running => Transition::RequestCancel,
            _ => return Ok(false),
        };
        entry.cancel.store(true, Ordering::Release);
        match entry.task.apply(transition, Utc::now()) {
            Ok(next) => entry.task = Arc::new(next),
            Err(err) => debug!(task_id = %id, error = %err, "cancel transition rejected"),
        }
        info!(task_id = %id, status = %entry.task.status, "cancellation requested");
        Ok(true)
    }

    fn result(&self, id: TaskId) -> Result<Artifact, QueueError> {
        let task = self.status(id)?;
        let reference = match (task.status, task.artifact) {
            (TaskStatus::Completed, Some(reference)) => reference,
            (status, _) => return Err(QueueError::NotReady { status }),
        };
        let artifacts = self.shared.runner.artifacts();
        let bytes = artifacts.get(&reference, Utc::now()).map_err(|err| match err {
            StorageError::NotFound(_) => QueueError::NotFound(id),
            other => QueueError::Storage(other),
        })?;
        if self.shared.delete_on_fetch {
            artifacts.remove(id)?;
            self.shared.tasks.write().remove(&id);
            debug!(task_id = %id, "artifact deleted after fetch");
        }
        Ok(Artifact { reference, bytes })
    }

    fn introspect(&self) -> QueueStats {
        let mut stats = QueueStats::new(
            QueueType::Local,
            self.shared.running.load(Ordering::Acquire),
            self.shared.max_workers,
        );
        for entry in self.shared.tasks.read().values() {
            stats.count(entry.task.status);
        }
        stats
    }

    fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, QueueError> {
        Ok(self.shared.sweep(now)?)
    }

    fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        let mut count = self.shared.in_flight.lock();
        while *count > 0 {
            self.shared.idle.wait(&mut count);
        }
        info!(queue = %QueueType::Local, "scheduler stopped");
    }
}

impl Drop for LocalScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::{Duration as StdDuration, Instant};

    use coinpress_pipeline::{CoinParameters, ImageSource, ReliefMeshBuilder};

    use super::*;

    fn settings(dir: &std::path::Path) -> Settings {
        Settings {
            artifact_dir: dir.to_path_buf(),
            max_workers: 2,
            ..Settings::default()
        }
    }

    fn scheduler(dir: &std::path::Path) -> LocalScheduler {
        LocalScheduler::with_builder(&settings(dir), Arc::new(ReliefMeshBuilder::new(32, 4))).unwrap()
    }

    fn job() -> GenerationJob {
        GenerationJob::new(
            ImageSource::Raw {
                width: 8,
                height: 8,
                pixels: (0..64).map(|i| i * 4).collect(),
            },
            CoinParameters::default(),
        )
    }

    fn wait_terminal(queue: &dyn TaskQueue, id: TaskId) -> GenerationTask {
        let deadline = Instant::now() + StdDuration::from_secs(30);
        loop {
            let task = queue.status(id).unwrap();
            if task.status.is_terminal() || Instant::now() > deadline {
                return task;
            }
            std::thread::sleep(StdDuration::from_millis(5));
        }
    }

    #[test]
    fn completes_and_serves_result() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = scheduler(tmp.path());
        let id = queue.submit(job()).unwrap();
        let task = wait_terminal(&queue, id);
        assert_eq!(task.status, TaskStatus::Completed, "{task:?}");
        assert_eq!(task.progress, 100);
        let first = queue.result(id).unwrap();
        let second = queue.result(id).unwrap();
        assert_eq!(first.bytes, second.bytes);
        assert!(!first.bytes.is_empty());
    }

    #[test]
    fn out_of_range_settings_refuse_to_start() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings {
            artifact_ttl_secs: u64::MAX,
            ..settings(tmp.path())
        };
        assert!(matches!(
            LocalScheduler::start(&settings),
            Err(QueueError::Startup(_))
        ));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = scheduler(tmp.path());
        let id = TaskId::new();
        assert!(matches!(queue.status(id), Err(QueueError::NotFound(_))));
        assert!(matches!(queue.cancel(id), Err(QueueError::NotFound(_))));
    }

    #[test]
    fn cancel_of_terminal_task_returns_false() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = scheduler(tmp.path());
        let id = queue.submit(job()).unwrap();
        wait_terminal(&queue, id);
        assert!(!queue.cancel(id).unwrap());
        assert_eq!(queue.status(id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn delete_on_fetch_removes_artifact_and_record() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings {
            delete_on_fetch: true,
            ..settings(tmp.path())
        };
        let queue =
            LocalScheduler::with_builder(&settings, Arc::new(ReliefMeshBuilder::new(16, 2))).unwrap();
        let id = queue.submit(job()).unwrap();
        wait_terminal(&queue, id);
        let artifact = queue.result(id).unwrap();
        assert!(!tmp.path().join(&artifact.reference.file_name).exists());
        assert!(matches!(queue.result(id), Err(QueueError::NotFound(_))));
    }

    #[test]
    fn sweep_evicts_expired_completed_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = scheduler(tmp.path());
        let id = queue.submit(job()).unwrap();
        wait_terminal(&queue, id);

        let report = queue.sweep(Utc::now() + Duration::hours(1)).unwrap();
        assert_eq!(report.artifacts_removed, 1);
        assert_eq!(report.tasks_evicted, 1);
        assert!(matches!(queue.status(id), Err(QueueError::NotFound(_))));
        assert_eq!(queue.introspect().total, 0);
    }

    #[test]
    fn shutdown_rejects_new_work_and_reports_unhealthy() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = scheduler(tmp.path());
        assert!(queue.health());
        queue.shutdown();
        assert!(!queue.health());
        assert!(matches!(queue.submit(job()), Err(QueueError::Stopped)));
        // A second shutdown is a no-op.
        queue.shutdown();
    }

    #[test]
    fn introspect_counts_by_status() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = scheduler(tmp.path());
        let ids: Vec<TaskId> = (0..3).map(|_| queue.submit(job()).unwrap()).collect();
        for id in &ids {
            wait_terminal(&queue, *id);
        }
        let stats = queue.introspect();
        assert_eq!(stats.queue_type, QueueType::Local);
        assert_eq!(stats.max_workers, 2);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 3);
    }
}
