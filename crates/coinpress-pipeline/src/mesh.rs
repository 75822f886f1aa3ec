//! Triangle meshes and the pluggable mesh-build step.
//!
//! The pipeline hands a [`FittedRelief`] to a [`MeshBuilder`] and gets a
//! closed triangle solid back. [`ReliefMeshBuilder`] is the built-in
//! engine; other engines plug in through the trait.

use serde::{Deserialize, Serialize};

use crate::transform::FittedRelief;
use crate::types::{PipelineError, Point};

/// An indexed triangle mesh in millimetres.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    /// Vertex positions `[x, y, z]`.
    pub vertices: Vec<[f32; 3]>,
    /// Counter-clockwise (outward-facing) vertex index triples.
    pub triangles: Vec<[u32; 3]>,
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Minimum corner.
    pub min: [f32; 3],
    /// Maximum corner.
    pub max: [f32; 3],
}

impl Bounds {
    /// Extent along each axis.
    #[must_use]
    pub fn size(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Grow to include `p`.
    pub fn include(&mut self, p: [f32; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(p[axis]);
            self.max[axis] = self.max[axis].max(p[axis]);
        }
    }

    /// Bounds of a point set, or `None` if it is empty.
    pub fn of_points<I: IntoIterator<Item = [f32; 3]>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bounds = Self {
            min: first,
            max: first,
        };
        for p in iter {
            bounds.include(p);
        }
        Some(bounds)
    }
}

impl Mesh {
    /// Number of triangles.
    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Bounding box of all vertices, or `None` for an empty mesh.
    #[must_use]
    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::of_points(self.vertices.iter().copied())
    }

    /// Index of the first triangle that refers to a vertex the mesh does
    /// not have.
    #[must_use]
    pub fn dangling_triangle(&self) -> Option<usize> {
        let len = self.vertices.len();
        self.triangles
            .iter()
            .position(|tri| tri.iter().any(|&i| i as usize >= len))
    }

    /// Triangle corner positions, resolving indices.
    ///
    /// Triangles referencing a missing vertex are skipped.
    pub fn triangle_positions(&self) -> impl Iterator<Item = [[f32; 3]; 3]> + '_ {
        self.triangles.iter().filter_map(|&[a, b, c]| {
            Some([
                *self.vertices.get(a as usize)?,
                *self.vertices.get(b as usize)?,
                *self.vertices.get(c as usize)?,
            ])
        })
    }
}

/// Turns a fitted relief into a triangle solid.
///
/// Implementations must be shareable across worker threads.
pub trait MeshBuilder: Send + Sync {
    /// Build the solid.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MeshBuild`] if the solid cannot be built.
    fn build(&self, relief: &FittedRelief) -> Result<Mesh, PipelineError>;
}

/// Built-in mesh engine: a closed solid over a radial grid.
///
/// The top surface is `rings` concentric copies of the outline boundary
/// (sampled with at least `sectors` points) joined to a centre vertex,
/// each vertex lifted to the relief height there. A flat bottom at
/// `z = 0` and a vertical side wall close the solid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliefMeshBuilder {
    /// Minimum number of boundary samples around the outline.
    pub sectors: usize,
    /// Number of concentric rings between centre and boundary.
    pub rings: usize,
}

impl ReliefMeshBuilder {
    /// Default angular resolution.
    pub const DEFAULT_SECTORS: usize = 256;
    /// Default radial resolution.
    pub const DEFAULT_RINGS: usize = 96;

    /// Create a builder with the given resolution.
    #[must_use]
    pub const fn new(sectors: usize, rings: usize) -> Self {
        Self { sectors, rings }
    }
}

impl Default for ReliefMeshBuilder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SECTORS, Self::DEFAULT_RINGS)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn vertex(p: Point, z: f64) -> [f32; 3] {
    [p.x as f32, p.y as f32, z as f32]
}

fn index(i: usize) -> Result<u32, PipelineError> {
    u32::try_from(i).map_err(|_| PipelineError::MeshBuild("mesh exceeds u32 vertex indices".into()))
}

impl MeshBuilder for ReliefMeshBuilder {
    fn build(&self, relief: &FittedRelief) -> Result<Mesh, PipelineError> {
        if self.sectors < 3 || self.rings == 0 {
            return Err(PipelineError::MeshBuild(format!(
                "resolution too low: {} sectors, {} rings",
                self.sectors, self.rings
            )));
        }

        let boundary = relief.outline().boundary_points(self.sectors);
        let s = boundary.len();
        let r = self.rings;

        // Layout: top centre, top rings 1..=r, bottom centre, bottom ring.
        let top_centre = 0usize;
        let top = |ring: usize, j: usize| 1 + (ring - 1) * s + (j % s);
        let bottom_centre = 1 + r * s;
        let bottom = |j: usize| 2 + r * s + (j % s);
        index(2 + r * s + s)?;

        let mut vertices = Vec::with_capacity(2 + r * s + s);
        let origin = Point::new(0.0, 0.0);
        vertices.push(vertex(origin, relief.surface_z(origin)));
        for ring in 1..=r {
            #[allow(clippy::cast_precision_loss)]
            let t = ring as f64 / r as f64;
            for b in &boundary {
                let p = Point::new(b.x * t, b.y * t);
                vertices.push(vertex(p, relief.surface_z(p)));
            }
        }
        vertices.push(vertex(origin, 0.0));
        for b in &boundary {
            vertices.push(vertex(*b, 0.0));
        }

        let mut triangles = Vec::with_capacity(2 * s * r + 3 * s);
        let mut tri = |a: usize, b: usize, c: usize| -> Result<(), PipelineError> {
            triangles.push([index(a)?, index(b)?, index(c)?]);
            Ok(())
        };
        for j in 0..s {
            tri(top_centre, top(1, j), top(1, j + 1))?;
        }
        for ring in 1..r {
            for j in 0..s {
                tri(top(ring, j), top(ring + 1, j), top(ring + 1, j + 1))?;
                tri(top(ring, j), top(ring + 1, j + 1), top(ring, j + 1))?;
            }
        }
        for j in 0..s {
            tri(bottom_centre, bottom(j + 1), bottom(j))?;
            tri(bottom(j), bottom(j + 1), top(r, j + 1))?;
            tri(bottom(j), top(r, j + 1), top(r, j))?;
        }

        tracing::debug!(
            vertices = vertices.len(),
            triangles = triangles.len(),
            "built relief mesh"
        );
        Ok(Mesh {
            vertices,
            triangles,
        })
    }
}
