//! Worker process loop and stuck-task reaper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use coinpress_pipeline::MeshBuilder;
use tracing::{debug, error, info, warn};

use super::broker::SpoolBroker;
use super::store::{FileStatusStore, StoreSink};
use crate::artifact::ArtifactStore;
use crate::config::Settings;
use crate::error::{ErrorKind, StorageError, TaskError};
use crate::progress::ProgressReporter;
use crate::runner::{GenerationRunner, Outcome};
use crate::task::{TaskStatus, Transition};

/// Consumes jobs from the broker and executes them.
///
/// Any number of workers, in any number of processes, may share one
/// spool; the broker guarantees each job is claimed once.
#[derive(Debug, Clone)]
pub struct Worker {
    broker: SpoolBroker,
    store: FileStatusStore,
    runner: GenerationRunner,
    poll: StdDuration,
}

impl Worker {
    /// Create a worker.
    #[must_use]
    pub const fn new(
        broker: SpoolBroker,
        store: FileStatusStore,
        runner: GenerationRunner,
        poll: StdDuration,
    ) -> Self {
        Self {
            broker,
            store,
            runner,
            poll,
        }
    }

    /// A worker on the spool and artifact store named by `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if a directory cannot be created.
    pub fn from_settings(
        settings: &Settings,
        builder: Arc<dyn MeshBuilder>,
    ) -> Result<Self, StorageError> {
        let artifacts = ArtifactStore::open(&settings.artifact_dir, settings.artifact_ttl())?;
        Ok(Self::new(
            SpoolBroker::open(&settings.spool_dir)?,
            FileStatusStore::open(&settings.spool_dir)?,
            GenerationRunner::new(builder, Arc::new(artifacts), settings.max_heightmap_resolution),
            settings.worker_poll(),
        ))
    }

    /// Claim and execute at most one job. Returns whether a message was
    /// consumed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the broker or status store is
    /// unreachable. Failures of the job itself are recorded on the task.
    pub fn run_once(&self) -> Result<bool, StorageError> {
        let Some(claimed) = self.broker.claim()? else {
            return Ok(false);
        };
        let id = claimed.message.task_id;
        info!(task_id = %id, "worker claimed job");

        match self.store.transition(id, Transition::Start, Utc::now()) {
            Ok(Some(_)) => {
                let sink = StoreSink::new(&self.store);
                let reporter = ProgressReporter::new(id, &sink);
                let terminal = match self.runner.run(id, &claimed.job, &reporter) {
                    Outcome::Completed(reference) => Transition::Complete(reference),
                    Outcome::Failed(error) => Transition::Fail(error),
                    Outcome::Cancelled => Transition::Cancel,
                };
                let produced = matches!(terminal, Transition::Complete(_));
                match self.store.transition(id, terminal, Utc::now())? {
                    Some(task) => info!(task_id = %id, status = %task.status, "task finished"),
                    None => {
                        warn!(task_id = %id, "task changed state while running; result discarded");
                        if produced {
                            self.runner.artifacts().remove(id)?;
                        }
                    }
                }
            }
            Ok(None) => debug!(task_id = %id, "skipping task that is no longer pending"),
            Err(StorageError::NotFound(_)) => debug!(task_id = %id, "skipping task with no record"),
            Err(err) => {
                // The record is still PENDING; put the job back for a retry.
                warn!(task_id = %id, error = %err, "could not start task; job requeued");
                self.broker.release(&claimed)?;
                return Err(err);
            }
        }
        self.broker.ack(&claimed)?;
        Ok(true)
    }

    /// Process jobs until `stop` is set, sleeping between empty polls.
    pub fn run(&self, stop: &AtomicBool) {
        info!(poll_ms = self.poll.as_millis(), "worker started");
        while !stop.load(Ordering::Acquire) {
            match self.run_once() {
                Ok(true) => {}
                Ok(false) => thread::sleep(self.poll),
                Err(err) => {
                    error!(error = %err, "worker poll failed");
                    thread::sleep(self.poll);
                }
            }
        }
        info!("worker stopped");
    }
}

/// Fail every RUNNING task that started more than `timeout` before `now`,
/// and delete the claimed message and payload its worker left behind.
///
/// A worker process that dies mid-job leaves its task RUNNING forever;
/// this is the only path by which such a task reaches a terminal state.
/// Returns the number of tasks failed.
///
/// # Errors
///
/// Returns [`StorageError`] if the store cannot be listed.
pub fn reap(
    broker: &SpoolBroker,
    store: &FileStatusStore,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Result<usize, StorageError> {
    let mut reaped = 0;
    for task in store.list()? {
        let stuck = task.status == TaskStatus::Running
            && task.started_at.is_some_and(|started| started + timeout < now);
        if !stuck {
            continue;
        }
        let error = TaskError::new(
            ErrorKind::Timeout,
            format!("no result within {}s; worker presumed dead", timeout.num_seconds()),
        );
        match store.transition(task.id, Transition::Fail(error), now) {
            Ok(Some(_)) => {
                warn!(task_id = %task.id, "reaped stuck task");
                reaped += 1;
                if let Err(err) = broker.discard(task.id) {
                    warn!(task_id = %task.id, error = %err, "failed to discard abandoned job");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(task_id = %task.id, error = %err, "failed to reap task"),
        }
    }
    Ok(reaped)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use coinpress_pipeline::{CoinParameters, ImageSource, ReliefMeshBuilder};

    use super::*;
    use crate::task::{GenerationJob, GenerationTask, TaskId};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn worker(root: &std::path::Path) -> Worker {
        let artifacts = ArtifactStore::open(root.join("artifacts"), Duration::minutes(30)).unwrap();
        Worker::new(
            SpoolBroker::open(root).unwrap(),
            FileStatusStore::open(root).unwrap(),
            GenerationRunner::new(
                Arc::new(ReliefMeshBuilder::new(16, 2)),
                Arc::new(artifacts),
                128,
            ),
            StdDuration::from_millis(1),
        )
    }

    fn enqueue(worker: &Worker) -> TaskId {
        let id = TaskId::new();
        let job = GenerationJob::new(
            ImageSource::Raw {
                width: 4,
                height: 4,
                pixels: vec![128; 16],
            },
            CoinParameters::default(),
        );
        worker
            .store
            .insert(&GenerationTask::new(id, job.fingerprint(), Utc::now()))
            .unwrap();
        worker.broker.publish(id, &job, Utc::now()).unwrap();
        id
    }

    #[test]
    fn run_once_completes_a_job() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = worker(tmp.path());
        assert!(!worker.run_once().unwrap());

        let id = enqueue(&worker);
        assert!(worker.run_once().unwrap());
        let task = worker.store.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.artifact.is_some());
        assert_eq!(worker.broker.pending_count().unwrap(), 0);
    }

    #[test]
    fn cancelled_while_queued_is_consumed_without_running() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = worker(tmp.path());
        let id = enqueue(&worker);
        worker.store.transition(id, Transition::Cancel, Utc::now()).unwrap();

        assert!(worker.run_once().unwrap());
        let task = worker.store.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn job_is_requeued_when_its_record_is_locked() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = worker(tmp.path());
        let id = enqueue(&worker);

        // Another process holds the record lock for the whole attempt.
        let lock = tmp.path().join("status").join(format!("{id}.lock"));
        std::fs::File::create(&lock).unwrap();
        assert!(matches!(worker.run_once(), Err(StorageError::Locked(_))));
        assert_eq!(worker.store.get(id).unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(worker.broker.pending_count().unwrap(), 1);

        std::fs::remove_file(&lock).unwrap();
        assert!(worker.run_once().unwrap());
        assert_eq!(worker.store.get(id).unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn reaping_a_dead_workers_task_clears_its_claim() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = worker(tmp.path());
        let id = enqueue(&worker);

        // A worker claims and starts the job, then dies without acking.
        let _abandoned = worker.broker.claim().unwrap().unwrap();
        worker.store.transition(id, Transition::Start, t0()).unwrap();

        let now = t0() + Duration::minutes(11);
        assert_eq!(reap(&worker.broker, &worker.store, Duration::minutes(10), now).unwrap(), 1);
        assert_eq!(std::fs::read_dir(tmp.path().join("claimed")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(tmp.path().join("payload")).unwrap().count(), 0);
    }

    #[test]
    fn reaper_fails_only_stale_running_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = SpoolBroker::open(tmp.path()).unwrap();
        let store = FileStatusStore::open(tmp.path()).unwrap();
        let mut ids = Vec::new();
        for started in [t0(), t0() + Duration::minutes(9)] {
            let id = TaskId::new();
            store.insert(&GenerationTask::new(id, String::new(), t0())).unwrap();
            store.transition(id, Transition::Start, started).unwrap();
            ids.push(id);
        }
        let queued = TaskId::new();
        store.insert(&GenerationTask::new(queued, String::new(), t0())).unwrap();

        let now = t0() + Duration::minutes(11);
        assert_eq!(reap(&broker, &store, Duration::minutes(10), now).unwrap(), 1);

        let reaped = store.get(ids[0]).unwrap().unwrap();
        assert_eq!(reaped.status, TaskStatus::Failed);
        assert_eq!(reaped.error.unwrap().kind, ErrorKind::Timeout);
        assert_eq!(store.get(ids[1]).unwrap().unwrap().status, TaskStatus::Running);
        assert_eq!(store.get(queued).unwrap().unwrap().status, TaskStatus::Pending);
    }
}
