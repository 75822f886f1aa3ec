//! Shared types for the coinpress generation core.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Re-export `GrayImage` so downstream crates can hand raw luminance
/// buffers to the pipeline without depending on `image` directly.
pub use image::GrayImage;

/// A 2D point in millimetres on the coin plane.
///
/// The coin centre is the origin, `+x` points right and `+y` points up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (mm).
    pub x: f64,
    /// Vertical position (mm).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Rotate about the origin by `angle` radians, counter-clockwise positive.
    #[must_use]
    pub fn rotate(self, angle: f64) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self {
            x: self.x.mul_add(cos, -(self.y * sin)),
            y: self.x.mul_add(sin, self.y * cos),
        }
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Returns `true` if either axis is zero.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Total number of pixels.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Substrate shape of the coin blank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinShape {
    /// Round disc; kept analytic, never polygonised by the core.
    #[default]
    Circle,
    /// Axis-aligned square with side equal to the diameter.
    Square,
    /// Regular hexagon inscribed in the diameter.
    Hexagon,
    /// Regular octagon inscribed in the diameter.
    Octagon,
}

impl CoinShape {
    /// Number of outline vertices, or `None` for the analytic circle.
    #[must_use]
    pub const fn vertex_count(self) -> Option<usize> {
        match self {
            Self::Circle => None,
            Self::Square => Some(4),
            Self::Hexagon => Some(6),
            Self::Octagon => Some(8),
        }
    }
}

impl fmt::Display for CoinShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Circle => f.write_str("circle"),
            Self::Square => f.write_str("square"),
            Self::Hexagon => f.write_str("hexagon"),
            Self::Octagon => f.write_str("octagon"),
        }
    }
}

/// Geometry of the coin and placement of the relief on its face.
///
/// Offsets are percentages of the diameter; rotation is in degrees,
/// counter-clockwise positive. Use [`validated`](Self::validated) before
/// handing parameters to the pipeline: it rejects impossible geometry and
/// normalises the rotation into `[0, 360)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoinParameters {
    /// Substrate outline.
    pub shape: CoinShape,
    /// Outer diameter in millimetres (side length for squares).
    pub diameter_mm: f64,
    /// Total thickness in millimetres, relief included.
    pub thickness_mm: f64,
    /// Maximum relief height in millimetres.
    pub relief_depth_mm: f64,
    /// User scale in percent; 100 makes the image width span the diameter.
    pub scale_pct: f64,
    /// Horizontal offset as a percentage of the diameter.
    pub offset_x_pct: f64,
    /// Vertical offset as a percentage of the diameter; positive moves the
    /// image down, as on screen.
    pub offset_y_pct: f64,
    /// Rotation in degrees, counter-clockwise positive.
    pub rotation_deg: f64,
}

impl CoinParameters {
    /// Default outer diameter (mm).
    pub const DEFAULT_DIAMETER_MM: f64 = 30.0;
    /// Default total thickness (mm).
    pub const DEFAULT_THICKNESS_MM: f64 = 3.0;
    /// Default relief depth (mm).
    pub const DEFAULT_RELIEF_DEPTH_MM: f64 = 1.0;
    /// Default user scale (%).
    pub const DEFAULT_SCALE_PCT: f64 = 100.0;

    /// Check the parameters and return a copy with the rotation
    /// normalised into `[0, 360)`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameters`] when a dimension is
    /// non-positive or non-finite, or when the relief is deeper than the
    /// coin is thick.
    pub fn validated(self) -> Result<Self, PipelineError> {
        let positive = [
            ("diameter_mm", self.diameter_mm),
            ("thickness_mm", self.thickness_mm),
            ("relief_depth_mm", self.relief_depth_mm),
            ("scale_pct", self.scale_pct),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(PipelineError::InvalidParameters(format!(
                    "{name} must be a positive finite number, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("offset_x_pct", self.offset_x_pct),
            ("offset_y_pct", self.offset_y_pct),
            ("rotation_deg", self.rotation_deg),
        ] {
            if !value.is_finite() {
                return Err(PipelineError::InvalidParameters(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }
        if self.relief_depth_mm > self.thickness_mm {
            return Err(PipelineError::InvalidParameters(format!(
                "relief_depth_mm ({}) exceeds thickness_mm ({})",
                self.relief_depth_mm, self.thickness_mm
            )));
        }
        Ok(Self {
            rotation_deg: normalize_degrees(self.rotation_deg),
            ..self
        })
    }

    /// Height of the flat substrate below the relief (mm).
    #[must_use]
    pub fn base_height_mm(&self) -> f64 {
        self.thickness_mm - self.relief_depth_mm
    }
}

impl Default for CoinParameters {
    fn default() -> Self {
        Self {
            shape: CoinShape::Circle,
            diameter_mm: Self::DEFAULT_DIAMETER_MM,
            thickness_mm: Self::DEFAULT_THICKNESS_MM,
            relief_depth_mm: Self::DEFAULT_RELIEF_DEPTH_MM,
            scale_pct: Self::DEFAULT_SCALE_PCT,
            offset_x_pct: 0.0,
            offset_y_pct: 0.0,
            rotation_deg: 0.0,
        }
    }
}

/// Normalise an angle in degrees into `[0, 360)`.
#[must_use]
pub fn normalize_degrees(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs.
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

/// Errors that can occur while turning an image into a coin mesh.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// A raw sample buffer did not match its declared dimensions.
    #[error("malformed raw image: {0}")]
    MalformedRaw(String),

    /// Coin or filter parameters are invalid.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Degenerate heightmap, outline, or placement.
    #[error("geometry error: {0}")]
    Geometry(String),

    /// The mesh-build collaborator failed.
    #[error("mesh build failed: {0}")]
    MeshBuild(String),
}
