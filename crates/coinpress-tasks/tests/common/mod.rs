//! Shared fixtures for the scheduler integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::path::Path;
use std::time::{Duration, Instant};

use coinpress_pipeline::{
    CoinParameters, FittedRelief, ImageSource, Mesh, MeshBuilder, PipelineError, ReliefMeshBuilder,
};
use coinpress_tasks::{GenerationJob, GenerationTask, QueueType, Settings, TaskId, TaskQueue};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use parking_lot::{Condvar, Mutex};

/// Encode a diagonal gradient as PNG.
pub fn gradient_png(width: u32, height: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.push(u8::try_from((x + y) * 255 / (width + height - 2).max(1)).unwrap());
        }
    }
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes)
        .write_image(&pixels, width, height, ExtendedColorType::L8)
        .unwrap();
    bytes
}

/// A 100x100 gradient on a default 30 mm circle.
pub fn coin_job() -> GenerationJob {
    GenerationJob::new(
        ImageSource::encoded(gradient_png(100, 100)),
        CoinParameters::default(),
    )
}

/// A tiny raw image; cheap enough to run many of.
pub fn small_job() -> GenerationJob {
    GenerationJob::new(
        ImageSource::Raw {
            width: 8,
            height: 8,
            pixels: vec![180; 64],
        },
        CoinParameters::default(),
    )
}

/// Scratch settings rooted at `root`.
pub fn settings(root: &Path, queue_type: QueueType) -> Settings {
    Settings {
        queue_type,
        max_workers: 1,
        artifact_dir: root.join("artifacts"),
        spool_dir: root.join("spool"),
        worker_poll_millis: 1,
        ..Settings::default()
    }
}

/// Poll until the task is terminal, or fail after ten seconds.
pub fn wait_terminal(queue: &dyn TaskQueue, id: TaskId) -> GenerationTask {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let task = queue.status(id).unwrap();
        if task.status.is_terminal() {
            return task;
        }
        assert!(Instant::now() < deadline, "task {id} stuck in {}", task.status);
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Mesh builder that parks every build until [`GatedBuilder::open`].
#[derive(Default)]
pub struct GatedBuilder {
    inner: ReliefMeshBuilder,
    state: Mutex<Gate>,
    changed: Condvar,
}

#[derive(Default)]
struct Gate {
    entered: usize,
    open: bool,
}

impl GatedBuilder {
    pub fn new() -> Self {
        Self {
            inner: ReliefMeshBuilder::new(24, 3),
            ..Self::default()
        }
    }

    /// Block until `n` builds have started.
    pub fn wait_entered(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut gate = self.state.lock();
        while gate.entered < n {
            assert!(
                !self.changed.wait_until(&mut gate, deadline).timed_out(),
                "mesh build never started"
            );
        }
    }

    /// Release every parked and future build.
    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }
}

impl MeshBuilder for GatedBuilder {
    fn build(&self, relief: &FittedRelief) -> Result<Mesh, PipelineError> {
        let mut gate = self.state.lock();
        gate.entered += 1;
        self.changed.notify_all();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !gate.open {
            if self.changed.wait_until(&mut gate, deadline).timed_out() {
                return Err(PipelineError::MeshBuild("gate never opened".to_string()));
            }
        }
        drop(gate);
        self.inner.build(relief)
    }
}
