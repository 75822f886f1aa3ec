//! coinpress-pipeline: pure relief-coin geometry core (sans-IO).
//!
//! Turns an image into a closed triangle solid through:
//! decode (+ optional filter) -> heightmap -> outline -> placement/fit ->
//! mesh build.
//!
//! This crate has **no I/O dependencies**. It operates on in-memory
//! buffers; scheduling, persistence, and serialisation live in
//! `coinpress-tasks` and `coinpress-export`.

pub mod decode;
pub mod filter;
pub mod fingerprint;
pub mod heightmap;
pub mod mesh;
pub mod outline;
pub mod pipeline;
pub mod transform;
pub mod types;

pub use decode::ImageSource;
pub use filter::{FilterSettings, GrayscaleMethod};
pub use fingerprint::fingerprint;
pub use heightmap::Heightmap;
pub use mesh::{Bounds, Mesh, MeshBuilder, ReliefMeshBuilder};
pub use outline::ShapeOutline;
pub use pipeline::Pipeline;
pub use transform::{FittedRelief, PlacedTexel, Placement};
pub use types::{CoinParameters, CoinShape, Dimensions, PipelineError, Point};
