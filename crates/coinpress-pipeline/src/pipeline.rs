//! Staged generation: advance one step at a time so a driver can report
//! progress and check for cancellation between steps.
//!
//! ```rust
//! # use coinpress_pipeline::{CoinParameters, ImageSource, Pipeline, PipelineError, ReliefMeshBuilder};
//! # fn run(png: Vec<u8>) -> Result<(), PipelineError> {
//! let meshed = Pipeline::new(ImageSource::encoded(png), CoinParameters::default())
//!     .decode()?
//!     .build_heightmap()?
//!     .outline()?
//!     .fit()?
//!     .build_mesh(&ReliefMeshBuilder::default())?;
//! let mesh = meshed.into_mesh();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage consumes `self`, so a stage can never run twice and no
//! stage can be skipped. Stages are pure: nothing here touches the
//! filesystem or the clock.

use image::GrayImage;

use crate::decode::{self, ImageSource};
use crate::filter::FilterSettings;
use crate::heightmap::{DEFAULT_MAX_RESOLUTION, Heightmap};
use crate::mesh::{Mesh, MeshBuilder};
use crate::outline::ShapeOutline;
use crate::transform::{self, FittedRelief};
use crate::types::{CoinParameters, PipelineError};

/// Entry point for the staged pipeline.
pub struct Pipeline;

impl Pipeline {
    /// Start a pipeline for `source` with `params` and no filtering.
    pub fn new(source: ImageSource, params: CoinParameters) -> Pending {
        Pending {
            source,
            params,
            filter: None,
            max_resolution: DEFAULT_MAX_RESOLUTION,
        }
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Nothing has been decoded yet.
#[must_use = "pipeline stages are consumed by advancing; call .decode() to continue"]
pub struct Pending {
    source: ImageSource,
    params: CoinParameters,
    filter: Option<FilterSettings>,
    max_resolution: u32,
}

impl Pending {
    /// Apply `filter` during decoding.
    pub fn with_filter(mut self, filter: Option<FilterSettings>) -> Self {
        self.filter = filter;
        self
    }

    /// Downsample heightmaps whose longest axis exceeds `max_resolution`.
    pub fn with_max_resolution(mut self, max_resolution: u32) -> Self {
        self.max_resolution = max_resolution;
        self
    }

    /// The source image.
    #[must_use]
    pub const fn source(&self) -> &ImageSource {
        &self.source
    }

    /// Decode and filter the source into gray samples.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyInput`], [`PipelineError::ImageDecode`],
    /// or [`PipelineError::MalformedRaw`] for unusable input.
    pub fn decode(self) -> Result<Decoded, PipelineError> {
        let gray = decode::decode(&self.source, self.filter.as_ref())?;
        Ok(Decoded {
            params: self.params,
            max_resolution: self.max_resolution,
            gray,
        })
    }
}

// ───────────────────────── Stage 1: Decoded ──────────────────────────

/// The filtered gray image is available.
#[must_use = "pipeline stages are consumed by advancing; call .build_heightmap() to continue"]
pub struct Decoded {
    params: CoinParameters,
    max_resolution: u32,
    gray: GrayImage,
}

impl Decoded {
    /// The filtered gray image.
    #[must_use]
    pub const fn gray(&self) -> &GrayImage {
        &self.gray
    }

    /// Normalise the gray image into a heightmap.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Geometry`] if the image has a zero dimension.
    pub fn build_heightmap(self) -> Result<HeightmapReady, PipelineError> {
        let heightmap = Heightmap::from_gray(&self.gray, self.max_resolution)?;
        Ok(HeightmapReady {
            params: self.params,
            heightmap,
        })
    }
}

// ───────────────────────── Stage 2: HeightmapReady ───────────────────

/// The normalised heightmap is available.
#[must_use = "pipeline stages are consumed by advancing; call .outline() to continue"]
pub struct HeightmapReady {
    params: CoinParameters,
    heightmap: Heightmap,
}

impl HeightmapReady {
    /// The heightmap.
    #[must_use]
    pub const fn heightmap(&self) -> &Heightmap {
        &self.heightmap
    }

    /// Validate the coin parameters and build the substrate outline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameters`] for impossible geometry.
    pub fn outline(self) -> Result<Outlined, PipelineError> {
        let params = self.params.validated()?;
        let outline = ShapeOutline::new(params.shape, params.diameter_mm)?;
        Ok(Outlined {
            params,
            heightmap: self.heightmap,
            outline,
        })
    }
}

// ───────────────────────── Stage 3: Outlined ─────────────────────────

/// The substrate outline is available.
#[must_use = "pipeline stages are consumed by advancing; call .fit() to continue"]
pub struct Outlined {
    params: CoinParameters,
    heightmap: Heightmap,
    outline: ShapeOutline,
}

impl Outlined {
    /// The substrate outline.
    #[must_use]
    pub const fn outline(&self) -> &ShapeOutline {
        &self.outline
    }

    /// Place the heightmap on the outline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Geometry`] if the placement is degenerate
    /// or misses the coin entirely.
    pub fn fit(self) -> Result<Fitted, PipelineError> {
        let relief = transform::fit(self.heightmap, self.outline, &self.params)?;
        Ok(Fitted { relief })
    }
}

// ───────────────────────── Stage 4: Fitted ───────────────────────────

/// The heightmap is placed and clipped.
#[must_use = "pipeline stages are consumed by advancing; call .build_mesh() to continue"]
pub struct Fitted {
    relief: FittedRelief,
}

impl Fitted {
    /// The fitted relief.
    #[must_use]
    pub const fn relief(&self) -> &FittedRelief {
        &self.relief
    }

    /// Hand the fitted relief to `builder`.
    ///
    /// # Errors
    ///
    /// Returns whatever the builder reports, normally
    /// [`PipelineError::MeshBuild`], or [`PipelineError::MeshBuild`] if the
    /// mesh is empty or indexes a vertex it does not have.
    pub fn build_mesh(self, builder: &dyn MeshBuilder) -> Result<Meshed, PipelineError> {
        let mesh = builder.build(&self.relief)?;
        if mesh.triangles.is_empty() {
            return Err(PipelineError::MeshBuild(
                "mesh builder returned no triangles".to_string(),
            ));
        }
        if let Some(index) = mesh.dangling_triangle() {
            return Err(PipelineError::MeshBuild(format!(
                "triangle {index} references a vertex outside the {} built",
                mesh.vertices.len()
            )));
        }
        Ok(Meshed {
            relief: self.relief,
            mesh,
        })
    }
}

// ───────────────────────── Stage 5: Meshed ───────────────────────────

/// Final stage: the triangle solid is available.
pub struct Meshed {
    relief: FittedRelief,
    mesh: Mesh,
}

impl Meshed {
    /// The built mesh.
    #[must_use]
    pub const fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// The relief the mesh was built from.
    #[must_use]
    pub const fn relief(&self) -> &FittedRelief {
        &self.relief
    }

    /// Consume the stage, keeping only the mesh.
    #[must_use]
    pub fn into_mesh(self) -> Mesh {
        self.mesh
    }
}
