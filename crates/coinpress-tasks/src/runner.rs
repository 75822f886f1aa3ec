//! Drives one job through the staged pipeline.
//!
//! Shared by every backend: the local thread pool and the distributed
//! worker both call [`GenerationRunner::run`]. Cancellation is checked
//! before each stage, never inside one, so a cancel that arrives during
//! the mesh build takes effect once the build returns.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use coinpress_pipeline::{MeshBuilder, Pipeline, PipelineError};
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactRef, ArtifactStore};
use crate::error::TaskError;
use crate::progress::{ProgressReporter, Stage};
use crate::task::{GenerationJob, TaskId};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The artifact was stored.
    Completed(ArtifactRef),
    /// A stage failed.
    Failed(TaskError),
    /// Cancellation was observed at a stage boundary.
    Cancelled,
}

/// Executes generation jobs against a mesh builder and an artifact store.
#[derive(Clone)]
pub struct GenerationRunner {
    builder: Arc<dyn MeshBuilder>,
    artifacts: Arc<ArtifactStore>,
    max_resolution: u32,
}

impl std::fmt::Debug for GenerationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRunner")
            .field("artifacts", &self.artifacts.dir())
            .field("max_resolution", &self.max_resolution)
            .finish_non_exhaustive()
    }
}

enum Abort {
    Cancelled,
    Failed(TaskError),
}

impl GenerationRunner {
    /// Create a runner.
    pub fn new(
        builder: Arc<dyn MeshBuilder>,
        artifacts: Arc<ArtifactStore>,
        max_resolution: u32,
    ) -> Self {
        Self {
            builder,
            artifacts,
            max_resolution,
        }
    }

    /// The artifact store results are written to.
    #[must_use]
    pub const fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    /// Run `job` for `task_id`, reporting through `reporter`.
    ///
    /// Never panics outward: a panic inside any stage is recorded as that
    /// stage's failure kind.
    pub fn run(&self, task_id: TaskId, job: &GenerationJob, reporter: &ProgressReporter<'_>) -> Outcome {
        info!(%task_id, fingerprint = %job.fingerprint(), "generation started");
        let outcome = match self.stages(task_id, job, reporter) {
            Ok(reference) => Outcome::Completed(reference),
            Err(Abort::Cancelled) => Outcome::Cancelled,
            Err(Abort::Failed(error)) => Outcome::Failed(error),
        };
        match &outcome {
            Outcome::Completed(reference) => {
                info!(%task_id, size = reference.size_bytes, "generation completed");
            }
            Outcome::Failed(error) => warn!(%task_id, kind = %error.kind, %error, "generation failed"),
            Outcome::Cancelled => info!(%task_id, "generation cancelled"),
        }
        outcome
    }

    fn stages(
        &self,
        task_id: TaskId,
        job: &GenerationJob,
        reporter: &ProgressReporter<'_>,
    ) -> Result<ArtifactRef, Abort> {
        let decoded = step(reporter, Stage::Decode, || {
            Pipeline::new(job.source.clone(), job.params)
                .with_filter(job.filter)
                .with_max_resolution(self.max_resolution)
                .decode()
        })?;
        let ready = step(reporter, Stage::Heightmap, || decoded.build_heightmap())?;
        let outlined = step(reporter, Stage::Outline, || ready.outline())?;
        let fitted = step(reporter, Stage::Fit, || outlined.fit())?;
        let meshed = step(reporter, Stage::MeshBuild, || fitted.build_mesh(self.builder.as_ref()))?;

        let header = format!("coinpress {task_id}");
        step(reporter, Stage::Persist, || {
            let bytes = coinpress_export::to_stl(meshed.mesh(), &header)
                .map_err(|e| e.to_string())?;
            self.artifacts
                .put(task_id, &bytes, Utc::now())
                .map_err(|e| e.to_string())
        })
    }
}

/// Run one stage: check for cancellation, announce it, execute it with
/// panics caught, and map any failure to the stage's error kind.
fn step<T, E, F>(reporter: &ProgressReporter<'_>, stage: Stage, f: F) -> Result<T, Abort>
where
    F: FnOnce() -> Result<T, E>,
    E: StageFailure,
{
    if reporter.cancelled() {
        debug!(task_id = %reporter.task_id(), %stage, "cancellation observed");
        return Err(Abort::Cancelled);
    }
    reporter.begin(stage);
    let result = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(|e| TaskError::new(stage.failure_kind(), e.describe())),
        Err(payload) => Err(TaskError::new(
            stage.failure_kind(),
            format!("{stage} stage panicked: {}", panic_message(payload.as_ref())),
        )),
    };
    match result {
        Ok(value) => {
            reporter.finish(stage);
            Ok(value)
        }
        Err(error) => Err(Abort::Failed(error)),
    }
}

trait StageFailure {
    fn describe(&self) -> String;
}

impl StageFailure for PipelineError {
    fn describe(&self) -> String {
        self.to_string()
    }
}

impl StageFailure for String {
    fn describe(&self) -> String {
        self.clone()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::Duration;
    use coinpress_pipeline::{CoinParameters, FittedRelief, ImageSource, Mesh, ReliefMeshBuilder};
    use parking_lot::Mutex;

    use super::*;
    use crate::error::ErrorKind;
    use crate::progress::{ProgressSink, ProgressUpdate};

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<ProgressUpdate>>,
        cancel: AtomicBool,
        cancel_after: Mutex<Option<Stage>>,
    }

    impl ProgressSink for Recorder {
        fn publish(&self, _task_id: TaskId, update: ProgressUpdate) {
            if *self.cancel_after.lock() == Some(update.stage) && update.progress == update.stage.range().1 {
                self.cancel.store(true, Ordering::SeqCst);
            }
            self.updates.lock().push(update);
        }

        fn cancel_requested(&self, _task_id: TaskId) -> bool {
            self.cancel.load(Ordering::SeqCst)
        }
    }

    struct Exploding;

    impl MeshBuilder for Exploding {
        fn build(&self, _relief: &FittedRelief) -> Result<Mesh, PipelineError> {
            panic!("kaboom");
        }
    }

    fn runner(dir: &std::path::Path, builder: Arc<dyn MeshBuilder>) -> GenerationRunner {
        let store = ArtifactStore::open(dir, Duration::minutes(30)).unwrap();
        GenerationRunner::new(builder, Arc::new(store), 256)
    }

    fn job() -> GenerationJob {
        GenerationJob::new(
            ImageSource::Raw {
                width: 16,
                height: 16,
                pixels: vec![200; 256],
            },
            CoinParameters::default(),
        )
    }

    #[test]
    fn successful_run_reports_every_stage_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path(), Arc::new(ReliefMeshBuilder::new(32, 4)));
        let sink = Recorder::default();
        let id = TaskId::new();
        let outcome = runner.run(id, &job(), &ProgressReporter::new(id, &sink));
        let Outcome::Completed(reference) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert!(tmp.path().join(&reference.file_name).exists());

        let updates = sink.updates.lock();
        let progress: Vec<u8> = updates.iter().map(|u| u.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert_eq!(progress.first(), Some(&0));
        assert_eq!(progress.last(), Some(&100));

        let mut stages: Vec<Stage> = updates.iter().map(|u| u.stage).collect();
        stages.dedup();
        assert_eq!(stages, Stage::ALL.to_vec());
    }

    #[test]
    fn cancel_before_first_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path(), Arc::new(ReliefMeshBuilder::new(32, 4)));
        let sink = Recorder::default();
        sink.cancel.store(true, Ordering::SeqCst);
        let id = TaskId::new();
        assert_eq!(
            runner.run(id, &job(), &ProgressReporter::new(id, &sink)),
            Outcome::Cancelled
        );
        assert!(sink.updates.lock().is_empty());
    }

    #[test]
    fn cancel_during_mesh_build_takes_effect_at_the_next_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path(), Arc::new(ReliefMeshBuilder::new(32, 4)));
        let sink = Recorder::default();
        *sink.cancel_after.lock() = Some(Stage::MeshBuild);
        let id = TaskId::new();
        assert_eq!(
            runner.run(id, &job(), &ProgressReporter::new(id, &sink)),
            Outcome::Cancelled
        );
        // The mesh stage ran to completion; nothing was persisted.
        assert!(sink.updates.lock().iter().all(|u| u.stage != Stage::Persist));
        assert!(!tmp.path().join(format!("{id}.stl")).exists());
    }

    #[test]
    fn panicking_mesh_builder_fails_the_task_only() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path(), Arc::new(Exploding));
        let sink = Recorder::default();
        let id = TaskId::new();
        let outcome = runner.run(id, &job(), &ProgressReporter::new(id, &sink));
        let Outcome::Failed(error) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(error.kind, ErrorKind::MeshBuild);
        assert!(error.message.contains("kaboom"));
    }

    #[test]
    fn geometry_failure_is_reported_with_stage_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path(), Arc::new(ReliefMeshBuilder::new(32, 4)));
        let sink = Recorder::default();
        let id = TaskId::new();
        let job = GenerationJob {
            params: CoinParameters {
                scale_pct: 5.0,
                offset_x_pct: 400.0,
                ..CoinParameters::default()
            },
            ..job()
        };
        let outcome = runner.run(id, &job, &ProgressReporter::new(id, &sink));
        assert!(matches!(
            outcome,
            Outcome::Failed(TaskError {
                kind: ErrorKind::Geometry,
                ..
            })
        ));
    }
}
