//! Pixel-to-world placement shared by the preview and the mesh build.
//!
//! The mapping is fixed and must not drift between the two consumers:
//!
//! 1. `base = diameter / W` so the image width spans the coin.
//! 2. `s = base * scale_pct / 100`.
//! 3. Texel `(col, row)` sits at `local = ((col + 0.5 - W/2) * s, (H/2 - row - 0.5) * s)`,
//!    i.e. the footprint is centred on the origin with image rows growing downward.
//! 4. `translated = local + (offset_x_pct, -offset_y_pct) / 100 * diameter`.
//!    Offsets are given in screen space, so a positive y offset moves the
//!    image down on the coin.
//! 5. `world = R(rotation_deg) * translated`, counter-clockwise about the coin centre.
//!
//! Clipping against the outline happens afterwards, in [`fit`].

use crate::heightmap::Heightmap;
use crate::outline::ShapeOutline;
use crate::types::{CoinParameters, Dimensions, PipelineError, Point, normalize_degrees};

/// Where a heightmap lands on the coin face, in millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    dimensions: Dimensions,
    base_scale: f64,
    final_scale: f64,
    translation: Point,
    rotation_deg: f64,
}

impl Placement {
    /// Compute the placement of a `dimensions`-sized heightmap.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Geometry`] if the heightmap has a zero
    /// dimension or the resulting transform is not finite.
    pub fn compute(dimensions: Dimensions, params: &CoinParameters) -> Result<Self, PipelineError> {
        if dimensions.is_empty() {
            return Err(PipelineError::Geometry(format!(
                "cannot place a {}x{} heightmap",
                dimensions.width, dimensions.height
            )));
        }
        let base_scale = params.diameter_mm / f64::from(dimensions.width);
        let final_scale = base_scale * (params.scale_pct / 100.0);
        let translation = Point::new(
            params.offset_x_pct / 100.0 * params.diameter_mm,
            -params.offset_y_pct / 100.0 * params.diameter_mm,
        );
        let placement = Self {
            dimensions,
            base_scale,
            final_scale,
            translation,
            rotation_deg: normalize_degrees(params.rotation_deg),
        };
        let finite = [final_scale, translation.x, translation.y, placement.rotation_deg]
            .iter()
            .all(|v| v.is_finite());
        if !finite || final_scale <= 0.0 {
            return Err(PipelineError::Geometry(
                "placement is not finite or has zero scale".to_string(),
            ));
        }
        Ok(placement)
    }

    /// Heightmap dimensions this placement was computed for.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Millimetres per texel before the user scale is applied.
    #[must_use]
    pub const fn base_scale(&self) -> f64 {
        self.base_scale
    }

    /// Millimetres per texel.
    #[must_use]
    pub const fn final_scale(&self) -> f64 {
        self.final_scale
    }

    /// Offset applied before rotation (mm).
    #[must_use]
    pub const fn translation(&self) -> Point {
        self.translation
    }

    /// Rotation in degrees, normalised into `[0, 360)`.
    #[must_use]
    pub const fn rotation_deg(&self) -> f64 {
        self.rotation_deg
    }

    /// Footprint of the scaled image, `(width_mm, height_mm)`.
    #[must_use]
    pub fn footprint_mm(&self) -> (f64, f64) {
        (
            f64::from(self.dimensions.width) * self.final_scale,
            f64::from(self.dimensions.height) * self.final_scale,
        )
    }

    /// The same placement rotated a further `degrees` about the coin centre.
    #[must_use]
    pub fn rotated(&self, degrees: f64) -> Self {
        Self {
            rotation_deg: normalize_degrees(self.rotation_deg + degrees),
            ..*self
        }
    }

    /// Map continuous pixel coordinates (origin at the image's top-left
    /// corner, y down) to world millimetres.
    #[must_use]
    pub fn pixel_to_world(&self, px: f64, py: f64) -> Point {
        let w = f64::from(self.dimensions.width);
        let h = f64::from(self.dimensions.height);
        let local = Point::new(
            (px - w / 2.0) * self.final_scale,
            (h / 2.0 - py) * self.final_scale,
        );
        let translated = Point::new(local.x + self.translation.x, local.y + self.translation.y);
        translated.rotate(self.rotation_deg.to_radians())
    }

    /// World position of a texel centre.
    #[must_use]
    pub fn texel_to_world(&self, col: u32, row: u32) -> Point {
        self.pixel_to_world(f64::from(col) + 0.5, f64::from(row) + 0.5)
    }

    /// Inverse of [`pixel_to_world`](Self::pixel_to_world).
    #[must_use]
    pub fn world_to_pixel(&self, world: Point) -> (f64, f64) {
        let w = f64::from(self.dimensions.width);
        let h = f64::from(self.dimensions.height);
        let translated = world.rotate(-self.rotation_deg.to_radians());
        let local = Point::new(
            translated.x - self.translation.x,
            translated.y - self.translation.y,
        );
        (
            local.x / self.final_scale + w / 2.0,
            h / 2.0 - local.y / self.final_scale,
        )
    }

    /// World-space corners of the placed image: top-left, top-right,
    /// bottom-right, bottom-left. This is the overlay a preview draws.
    #[must_use]
    pub fn footprint_corners(&self) -> [Point; 4] {
        let w = f64::from(self.dimensions.width);
        let h = f64::from(self.dimensions.height);
        [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(w, 0.0),
            self.pixel_to_world(w, h),
            self.pixel_to_world(0.0, h),
        ]
    }
}

/// A heightmap placed on and clipped to a coin outline.
///
/// This is what the mesh builder consumes: it answers "how tall is the
/// relief at this world point" without knowing about pixels.
#[derive(Debug, Clone)]
pub struct FittedRelief {
    heightmap: Heightmap,
    outline: ShapeOutline,
    placement: Placement,
    thickness_mm: f64,
    relief_depth_mm: f64,
}

impl FittedRelief {
    /// The placed heightmap.
    #[must_use]
    pub const fn heightmap(&self) -> &Heightmap {
        &self.heightmap
    }

    /// The clipping outline.
    #[must_use]
    pub const fn outline(&self) -> &ShapeOutline {
        &self.outline
    }

    /// The pixel-to-world transform.
    #[must_use]
    pub const fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Total coin thickness (mm).
    #[must_use]
    pub const fn thickness_mm(&self) -> f64 {
        self.thickness_mm
    }

    /// Maximum relief height (mm).
    #[must_use]
    pub const fn relief_depth_mm(&self) -> f64 {
        self.relief_depth_mm
    }

    /// Normalised relief at a world point, `0.0` outside the image
    /// footprint or the outline.
    #[must_use]
    pub fn height_at(&self, world: Point) -> f64 {
        if !self.outline.contains(world) {
            return 0.0;
        }
        let (px, py) = self.placement.world_to_pixel(world);
        self.heightmap
            .sample_bilinear(px, py)
            .map_or(0.0, f64::from)
    }

    /// Top-surface height at a world point (mm above the coin bottom).
    #[must_use]
    pub fn surface_z(&self, world: Point) -> f64 {
        let base = self.thickness_mm - self.relief_depth_mm;
        self.relief_depth_mm.mul_add(self.height_at(world), base)
    }

    /// Every texel centre in world space, row-major, with its height and
    /// whether it survives clipping.
    pub fn placed_texels(&self) -> impl Iterator<Item = PlacedTexel> + '_ {
        let width = self.heightmap.width();
        (0..self.heightmap.height()).flat_map(move |row| {
            (0..width).map(move |col| {
                let world = self.placement.texel_to_world(col, row);
                PlacedTexel {
                    col,
                    row,
                    world,
                    height: self.heightmap.get(col, row).unwrap_or(0.0),
                    inside: self.outline.contains(world),
                }
            })
        })
    }
}

/// One heightmap texel after placement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedTexel {
    /// Source column.
    pub col: u32,
    /// Source row.
    pub row: u32,
    /// Texel centre in world millimetres.
    pub world: Point,
    /// Normalised height.
    pub height: f32,
    /// Whether the texel centre lies inside the outline.
    pub inside: bool,
}

/// Place `heightmap` on `outline` according to `params`.
///
/// # Errors
///
/// Returns [`PipelineError::Geometry`] if the placement is degenerate or
/// no texel centre lands inside the outline.
pub fn fit(
    heightmap: Heightmap,
    outline: ShapeOutline,
    params: &CoinParameters,
) -> Result<FittedRelief, PipelineError> {
    let placement = Placement::compute(heightmap.dimensions(), params)?;
    let relief = FittedRelief {
        heightmap,
        outline,
        placement,
        thickness_mm: params.thickness_mm,
        relief_depth_mm: params.relief_depth_mm,
    };
    if !relief.placed_texels().any(|t| t.inside) {
        return Err(PipelineError::Geometry(
            "placed image lies entirely outside the coin outline".to_string(),
        ));
    }
    Ok(relief)
}
