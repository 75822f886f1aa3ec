//! coinpress: turn images into 3D-printable relief coins.
//!
//! # Usage
//!
//! ```text
//! coinpress generate photo.png -o coin.stl --shape hexagon --diameter 40
//! coinpress worker                    # distributed worker process
//! coinpress status <TASK_ID>
//! coinpress fetch <TASK_ID> -o coin.stl
//! coinpress inspect coin.stl
//! ```
//!
//! Settings come from `--config <FILE>` (JSON) and `COINPRESS_*`
//! environment variables; see `coinpress_tasks::Settings`.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use coinpress_pipeline::{CoinParameters, CoinShape, FilterSettings, ImageSource};
use coinpress_tasks::distributed::{FileStatusStore, SpoolBroker, reap};
use coinpress_tasks::housekeeping::Housekeeper;
use coinpress_tasks::{
    ArtifactStore, DistributedScheduler, GenerationJob, ProgressRecord, QueueType, Settings,
    TaskId, TaskQueue, TaskStatus, Worker, build_queue,
};

/// Generate, schedule, and inspect relief coins.
#[derive(Parser)]
#[command(name = "coinpress", version)]
struct Cli {
    /// JSON settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit an image and write the resulting STL.
    Generate(GenerateArgs),
    /// Run a distributed worker until killed.
    Worker {
        /// Exit once the queue is empty instead of polling forever.
        #[arg(long)]
        drain: bool,
    },
    /// Print a task's status as JSON.
    Status {
        /// Task id.
        id: TaskId,
    },
    /// Download a completed task's STL.
    Fetch {
        /// Task id.
        id: TaskId,
        /// Output path.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Cancel a task.
    Cancel {
        /// Task id.
        id: TaskId,
    },
    /// Delete expired artifacts and task records now.
    Sweep,
    /// Summarise a binary STL file.
    Inspect {
        /// STL file.
        path: PathBuf,
    },
}

#[derive(clap::Args)]
struct GenerateArgs {
    /// Input image (PNG, JPEG, BMP, WebP).
    image: PathBuf,

    /// Output STL path.
    #[arg(short, long)]
    output: PathBuf,

    /// Coin outline.
    #[arg(long, value_enum, default_value_t = Shape::Circle)]
    shape: Shape,

    /// Outer diameter in millimetres (side length for squares).
    #[arg(long, default_value_t = CoinParameters::DEFAULT_DIAMETER_MM)]
    diameter: f64,

    /// Total thickness in millimetres.
    #[arg(long, default_value_t = CoinParameters::DEFAULT_THICKNESS_MM)]
    thickness: f64,

    /// Relief depth in millimetres (at most the thickness).
    #[arg(long, default_value_t = CoinParameters::DEFAULT_RELIEF_DEPTH_MM)]
    relief_depth: f64,

    /// Image scale in percent of the fitted size.
    #[arg(long, default_value_t = CoinParameters::DEFAULT_SCALE_PCT)]
    scale: f64,

    /// Horizontal offset in percent of the diameter.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    offset_x: f64,

    /// Vertical offset in percent of the diameter (positive moves down).
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    offset_y: f64,

    /// Counter-clockwise rotation in degrees.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    rotation: f64,

    /// Pixel filter as a JSON `FilterSettings` object.
    #[arg(long)]
    filter_json: Option<String>,

    /// Print the task id and exit without waiting (distributed backend).
    #[arg(long)]
    detach: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Shape {
    Circle,
    Square,
    Hexagon,
    Octagon,
}

impl From<Shape> for CoinShape {
    fn from(shape: Shape) -> Self {
        match shape {
            Shape::Circle => Self::Circle,
            Shape::Square => Self::Square,
            Shape::Hexagon => Self::Hexagon,
            Shape::Octagon => Self::Octagon,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Generate(args) => generate(&settings, &args),
        Command::Worker { drain } => worker(&settings, drain),
        Command::Status { id } => status(&settings, id),
        Command::Fetch { id, output } => fetch(&settings, id, &output),
        Command::Cancel { id } => cancel(&settings, id),
        Command::Sweep => sweep(&settings),
        Command::Inspect { path } => inspect(&path),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn generate(settings: &Settings, args: &GenerateArgs) -> Result<(), String> {
    let bytes = std::fs::read(&args.image)
        .map_err(|e| format!("Error reading {}: {e}", args.image.display()))?;
    let params = CoinParameters {
        shape: args.shape.into(),
        diameter_mm: args.diameter,
        thickness_mm: args.thickness,
        relief_depth_mm: args.relief_depth,
        scale_pct: args.scale,
        offset_x_pct: args.offset_x,
        offset_y_pct: args.offset_y,
        rotation_deg: args.rotation,
    };
    let mut job = GenerationJob::new(ImageSource::encoded(bytes), params);
    if let Some(json) = &args.filter_json {
        let filter: FilterSettings =
            serde_json::from_str(json).map_err(|e| format!("Error parsing --filter-json: {e}"))?;
        job = job.with_filter(filter);
    }

    let queue = build_queue(settings).map_err(|e| format!("Error starting queue: {e}"))?;
    let id = queue.submit(job).map_err(|e| format!("Rejected: {e}"))?;
    if args.detach {
        println!("{id}");
        return Ok(());
    }
    if settings.queue_type == QueueType::Distributed {
        eprintln!("Submitted {id}; waiting for a worker (run `coinpress worker`)");
    }

    let mut last = None;
    let task = loop {
        let task = queue.status(id).map_err(|e| format!("Lost task {id}: {e}"))?;
        if last != Some(task.progress) {
            eprintln!("[{:>3}%] {}", task.progress, task.message);
            last = Some(task.progress);
        }
        if task.status.is_terminal() {
            break task;
        }
        thread::sleep(Duration::from_millis(100));
    };

    let outcome = match task.status {
        TaskStatus::Completed => {
            let artifact = queue.result(id).map_err(|e| format!("Error fetching result: {e}"))?;
            write_output(&args.output, &artifact.bytes)
        }
        TaskStatus::Failed => Err(task
            .error
            .map_or_else(|| "Generation failed".to_string(), |e| format!("Generation failed: {e}"))),
        _ => Err(format!("Task {id} was {}", task.status)),
    };
    queue.shutdown();
    outcome
}

fn worker(settings: &Settings, drain: bool) -> Result<(), String> {
    let worker = Worker::from_settings(settings, Arc::new(settings.mesh_builder()))
        .map_err(|e| format!("Error opening spool: {e}"))?;

    if drain {
        let mut consumed = 0usize;
        while worker.run_once().map_err(|e| format!("Worker error: {e}"))? {
            consumed += 1;
        }
        eprintln!("Drained {consumed} job(s)");
        return Ok(());
    }

    let broker = SpoolBroker::open(&settings.spool_dir)
        .map_err(|e| format!("Error opening spool: {e}"))?;
    let store = FileStatusStore::open(&settings.spool_dir)
        .map_err(|e| format!("Error opening status store: {e}"))?;
    let timeout = settings.task_timeout();
    let _reaper = Housekeeper::spawn("reaper", settings.reaper_interval(), move || {
        if let Err(err) = reap(&broker, &store, timeout, Utc::now()) {
            tracing::warn!(error = %err, "reaper pass failed");
        }
    })
    .map_err(|e| format!("Error starting reaper: {e}"))?;

    worker.run(&AtomicBool::new(false));
    Ok(())
}

/// Status, fetch, and cancel address tasks held by another process, which
/// only the distributed backend can see.
fn connect(settings: &Settings) -> Result<DistributedScheduler, String> {
    if settings.queue_type != QueueType::Distributed {
        return Err(
            "this command needs queue_type = distributed; local tasks live only inside `generate`"
                .to_string(),
        );
    }
    DistributedScheduler::connect(settings).map_err(|e| format!("Error opening spool: {e}"))
}

fn status(settings: &Settings, id: TaskId) -> Result<(), String> {
    let task = connect(settings)?.status(id).map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&ProgressRecord::from(&task))
        .map_err(|e| format!("Error serializing status: {e}"))?;
    println!("{json}");
    Ok(())
}

fn fetch(settings: &Settings, id: TaskId, output: &Path) -> Result<(), String> {
    let artifact = connect(settings)?.result(id).map_err(|e| e.to_string())?;
    write_output(output, &artifact.bytes)
}

fn cancel(settings: &Settings, id: TaskId) -> Result<(), String> {
    if connect(settings)?.cancel(id).map_err(|e| e.to_string())? {
        eprintln!("Cancellation requested for {id}");
    } else {
        eprintln!("Task {id} has already finished");
    }
    Ok(())
}

fn sweep(settings: &Settings) -> Result<(), String> {
    let now = Utc::now();
    let report = match settings.queue_type {
        QueueType::Distributed => connect(settings)?.sweep(now).map_err(|e| e.to_string())?,
        QueueType::Local => ArtifactStore::open(&settings.artifact_dir, settings.artifact_ttl())
            .and_then(|store| store.sweep(now))
            .map_err(|e| e.to_string())?,
    };
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| format!("Error serializing report: {e}"))?;
    println!("{json}");
    Ok(())
}

fn inspect(path: &Path) -> Result<(), String> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    let doc = coinpress_export::from_stl(&bytes).map_err(|e| format!("Invalid STL: {e}"))?;
    println!("triangles: {}", doc.triangles.len());
    if let Some(bounds) = doc.bounds() {
        let [x, y, z] = bounds.size();
        println!("min:  {:?}", bounds.min);
        println!("max:  {:?}", bounds.max);
        println!("size: {x:.3} x {y:.3} x {z:.3} mm");
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<(), String> {
    std::fs::write(path, bytes).map_err(|e| format!("Error writing {}: {e}", path.display()))?;
    eprintln!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}
