//! End-to-end behaviour of the broker-backed scheduler and its workers.

#![allow(clippy::unwrap_used)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use chrono::{Duration, Utc};
use coinpress_pipeline::{CoinParameters, ImageSource, ReliefMeshBuilder};
use coinpress_tasks::{
    DistributedScheduler, ErrorKind, GenerationJob, QueueError, QueueType, TaskQueue, TaskStatus,
    Transition, Worker, build_queue,
};
use common::{GatedBuilder, coin_job, settings, small_job};

fn worker(settings: &coinpress_tasks::Settings) -> Worker {
    Worker::from_settings(settings, Arc::new(ReliefMeshBuilder::new(128, 24))).unwrap()
}

#[test]
fn worker_process_produces_a_thirty_millimetre_coin() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path(), QueueType::Distributed);
    let queue = DistributedScheduler::connect(&settings).unwrap();

    let id = queue.submit(coin_job()).unwrap();
    assert_eq!(queue.status(id).unwrap().status, TaskStatus::Pending);
    assert!(worker(&settings).run_once().unwrap());

    let task = queue.status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{task:?}");
    assert_eq!(task.progress, 100);

    let artifact = queue.result(id).unwrap();
    let bounds = coinpress_export::from_stl(&artifact.bytes)
        .unwrap()
        .bounds()
        .unwrap();
    let [width, depth, _] = bounds.size();
    assert!((width - 30.0).abs() < 0.1, "width {width}");
    assert!((depth - 30.0).abs() < 0.1, "depth {depth}");
    assert!(bounds.max[2] >= 2.0 && bounds.max[2] <= 3.0 + 1e-4);
    assert_eq!(queue.result(id).unwrap(), artifact);
}

#[test]
fn invalid_jobs_leave_no_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path(), QueueType::Distributed);
    let queue = DistributedScheduler::connect(&settings).unwrap();

    let empty = GenerationJob::new(
        ImageSource::Raw {
            width: 0,
            height: 0,
            pixels: Vec::new(),
        },
        CoinParameters::default(),
    );
    assert!(matches!(queue.submit(empty), Err(QueueError::Validation(_))));
    let too_deep = GenerationJob {
        params: CoinParameters {
            relief_depth_mm: 4.0,
            ..CoinParameters::default()
        },
        ..small_job()
    };
    assert!(matches!(queue.submit(too_deep), Err(QueueError::Validation(_))));

    assert_eq!(queue.introspect().total, 0);
    assert!(!worker(&settings).run_once().unwrap());
}

#[test]
fn cancel_while_pending_is_skipped_by_the_worker() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path(), QueueType::Distributed);
    let queue = DistributedScheduler::connect(&settings).unwrap();

    let id = queue.submit(small_job()).unwrap();
    assert!(queue.cancel(id).unwrap());
    assert_eq!(queue.status(id).unwrap().status, TaskStatus::Cancelled);

    assert!(worker(&settings).run_once().unwrap());
    let task = queue.status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.started_at.is_none());
    assert!(matches!(queue.result(id), Err(QueueError::NotReady { .. })));
}

#[test]
fn cancel_while_running_is_seen_at_the_next_stage_boundary() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path(), QueueType::Distributed);
    let queue = DistributedScheduler::connect(&settings).unwrap();
    let gate = Arc::new(GatedBuilder::new());
    let worker = Worker::from_settings(&settings, gate.clone()).unwrap();

    let id = queue.submit(small_job()).unwrap();
    let handle = thread::spawn(move || worker.run_once().unwrap());
    gate.wait_entered(1);

    assert_eq!(queue.status(id).unwrap().status, TaskStatus::Running);
    assert!(matches!(
        queue.result(id),
        Err(QueueError::NotReady {
            status: TaskStatus::Running
        })
    ));
    assert!(queue.cancel(id).unwrap());
    gate.open();
    assert!(handle.join().unwrap());

    let task = queue.status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.cancel_requested);
    assert!(task.artifact.is_none());
}

#[test]
fn reaper_times_out_a_task_whose_worker_died() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path(), QueueType::Distributed);
    let queue = DistributedScheduler::connect(&settings).unwrap();

    let id = queue.submit(small_job()).unwrap();
    // A worker starts the task and is never heard from again.
    let started = Utc::now() - Duration::minutes(11);
    queue.store().transition(id, Transition::Start, started).unwrap();

    assert_eq!(queue.reap(Duration::minutes(10), Utc::now()).unwrap(), 1);
    let task = queue.status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().kind, ErrorKind::Timeout);

    // Terminal tasks are left alone on later passes.
    assert_eq!(queue.reap(Duration::minutes(10), Utc::now()).unwrap(), 0);
}

#[test]
fn competing_workers_run_each_job_once() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path(), QueueType::Distributed);
    let queue = DistributedScheduler::connect(&settings).unwrap();
    let ids: HashSet<_> = (0..6).map(|_| queue.submit(small_job()).unwrap()).collect();

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let worker = worker(&settings);
            thread::spawn(move || {
                let mut consumed = 0;
                while worker.run_once().unwrap() {
                    consumed += 1;
                }
                consumed
            })
        })
        .collect();
    let consumed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(consumed, ids.len());
    for id in ids {
        assert_eq!(queue.status(id).unwrap().status, TaskStatus::Completed);
    }
}

#[test]
fn backend_is_chosen_by_configuration() {
    let tmp = tempfile::tempdir().unwrap();
    for queue_type in [QueueType::Local, QueueType::Distributed] {
        let queue = build_queue(&settings(tmp.path(), queue_type)).unwrap();
        let stats = queue.introspect();
        assert_eq!(stats.queue_type, queue_type);
        assert!(stats.is_running);
        queue.shutdown();
        assert!(!queue.health());
    }
}
