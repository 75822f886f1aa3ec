//! End-to-end behaviour of the in-process scheduler.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use coinpress_pipeline::{
    CoinParameters, FittedRelief, ImageSource, Mesh, MeshBuilder, PipelineError, ReliefMeshBuilder,
};
use coinpress_tasks::{
    ErrorKind, GenerationJob, LocalScheduler, QueueError, QueueType, Stage, TaskQueue, TaskStatus,
};
use common::{GatedBuilder, coin_job, settings, small_job, wait_terminal};

#[test]
fn circle_coin_round_trips_through_stl() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = LocalScheduler::start(&coinpress_tasks::Settings {
        mesh: coinpress_tasks::MeshSettings {
            sectors: 128,
            rings: 24,
        },
        ..settings(tmp.path(), QueueType::Local)
    })
    .unwrap();

    let id = queue.submit(coin_job()).unwrap();
    let task = wait_terminal(&queue, id);
    assert_eq!(task.status, TaskStatus::Completed, "{task:?}");
    assert_eq!(task.progress, 100);
    assert_eq!(task.stage, Some(Stage::Persist));

    let artifact = queue.result(id).unwrap();
    let doc = coinpress_export::from_stl(&artifact.bytes).unwrap();
    let bounds = doc.bounds().unwrap();
    let [width, depth, _] = bounds.size();
    assert!((width - 30.0).abs() < 0.1, "width {width}");
    assert!((depth - 30.0).abs() < 0.1, "depth {depth}");
    assert!(bounds.max[2] >= 2.0 && bounds.max[2] <= 3.0 + 1e-4, "{bounds:?}");

    // Fetching again returns the same bytes.
    assert_eq!(queue.result(id).unwrap().bytes, artifact.bytes);
}

#[test]
fn zero_sized_image_is_rejected_without_a_task() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = LocalScheduler::start(&settings(tmp.path(), QueueType::Local)).unwrap();
    let job = GenerationJob::new(
        ImageSource::Raw {
            width: 0,
            height: 0,
            pixels: Vec::new(),
        },
        CoinParameters::default(),
    );
    assert!(matches!(queue.submit(job), Err(QueueError::Validation(_))));
    assert_eq!(queue.introspect().total, 0);
}

#[test]
fn relief_deeper_than_coin_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = LocalScheduler::start(&settings(tmp.path(), QueueType::Local)).unwrap();
    let job = GenerationJob {
        params: CoinParameters {
            thickness_mm: 3.0,
            relief_depth_mm: 5.0,
            ..CoinParameters::default()
        },
        ..small_job()
    };
    assert!(matches!(queue.submit(job), Err(QueueError::Validation(_))));
    assert_eq!(queue.introspect().total, 0);
}

#[test]
fn cancel_while_pending_never_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let gate = Arc::new(GatedBuilder::new());
    let queue = LocalScheduler::with_builder(
        &settings(tmp.path(), QueueType::Local),
        gate.clone(),
    )
    .unwrap();

    // The single worker is parked inside the first job's mesh build.
    let busy = queue.submit(small_job()).unwrap();
    gate.wait_entered(1);
    let queued = queue.submit(small_job()).unwrap();
    assert_eq!(queue.status(queued).unwrap().status, TaskStatus::Pending);

    assert!(queue.cancel(queued).unwrap());
    assert_eq!(queue.status(queued).unwrap().status, TaskStatus::Cancelled);
    assert!(matches!(
        queue.result(busy),
        Err(QueueError::NotReady {
            status: TaskStatus::Running
        })
    ));

    gate.open();
    assert_eq!(wait_terminal(&queue, busy).status, TaskStatus::Completed);
    let cancelled = wait_terminal(&queue, queued);
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.started_at.is_none());
    assert!(matches!(queue.result(queued), Err(QueueError::NotReady { .. })));
}

#[test]
fn cancel_while_running_stops_at_next_stage_boundary() {
    let tmp = tempfile::tempdir().unwrap();
    let gate = Arc::new(GatedBuilder::new());
    let queue = LocalScheduler::with_builder(
        &settings(tmp.path(), QueueType::Local),
        gate.clone(),
    )
    .unwrap();

    let id = queue.submit(small_job()).unwrap();
    gate.wait_entered(1);
    assert!(queue.cancel(id).unwrap());
    let task = queue.status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.cancel_requested);

    gate.open();
    let task = wait_terminal(&queue, id);
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.artifact.is_none());
    // Mesh build finished; persist never started.
    assert_eq!(task.stage, Some(Stage::MeshBuild));
    assert!(!queue.cancel(id).unwrap());
}

#[test]
fn failure_of_one_task_does_not_affect_others() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = LocalScheduler::with_builder(
        &coinpress_tasks::Settings {
            max_workers: 2,
            ..settings(tmp.path(), QueueType::Local)
        },
        Arc::new(ReliefMeshBuilder::new(24, 3)),
    )
    .unwrap();

    let off_coin = GenerationJob {
        params: CoinParameters {
            scale_pct: 5.0,
            offset_x_pct: 400.0,
            ..CoinParameters::default()
        },
        ..small_job()
    };
    let bad = queue.submit(off_coin).unwrap();
    let good = queue.submit(small_job()).unwrap();

    let failed = wait_terminal(&queue, bad);
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.unwrap().kind, ErrorKind::Geometry);
    assert!(failed.artifact.is_none());
    assert_eq!(wait_terminal(&queue, good).status, TaskStatus::Completed);
}

/// Returns a mesh whose second triangle points past the vertex list.
struct DanglingIndexBuilder;

impl MeshBuilder for DanglingIndexBuilder {
    fn build(&self, _relief: &FittedRelief) -> Result<Mesh, PipelineError> {
        Ok(Mesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            triangles: vec![[0, 1, 2], [0, 1, 7]],
        })
    }
}

#[test]
fn corrupt_mesh_fails_the_task_instead_of_completing() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = LocalScheduler::with_builder(
        &settings(tmp.path(), QueueType::Local),
        Arc::new(DanglingIndexBuilder),
    )
    .unwrap();

    let id = queue.submit(small_job()).unwrap();
    let task = wait_terminal(&queue, id);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().kind, ErrorKind::MeshBuild);
    assert!(matches!(queue.result(id), Err(QueueError::NotReady { .. })));
}

#[test]
fn progress_observed_by_a_poller_never_decreases() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = LocalScheduler::start(&settings(tmp.path(), QueueType::Local)).unwrap();
    let id = queue.submit(coin_job()).unwrap();

    let mut seen = Vec::new();
    loop {
        let task = queue.status(id).unwrap();
        seen.push(task.progress);
        if task.status.is_terminal() {
            break;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&100));
}

#[test]
fn shutdown_waits_for_in_flight_work() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = LocalScheduler::start(&settings(tmp.path(), QueueType::Local)).unwrap();
    let ids: Vec<_> = (0..3).map(|_| queue.submit(small_job()).unwrap()).collect();
    queue.shutdown();
    for id in ids {
        assert!(queue.status(id).unwrap().status.is_terminal());
    }
    assert!(!queue.health());
}
