//! Substrate outlines for each coin shape.
//!
//! Polygonal shapes are centred on the origin and wound counter-clockwise,
//! matching the order a preview canvas draws them in. The circle stays an
//! analytic radius; only [`ShapeOutline::boundary_points`] discretises it,
//! and only at the resolution the mesh builder asks for.

use std::f64::consts::TAU;

use geo::{Area, Intersects};

use crate::types::{CoinShape, PipelineError, Point};

/// Convert a coin-plane [`Point`] to a `geo::Coord`.
const fn point_to_coord(p: Point) -> geo::Coord<f64> {
    geo::Coord { x: p.x, y: p.y }
}

/// The 2D boundary of a coin blank.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeOutline {
    /// Round blank described by its radius in millimetres.
    Circle {
        /// Radius (mm).
        radius: f64,
    },
    /// Convex polygonal blank.
    Polygon {
        /// Which polygonal shape this is.
        shape: CoinShape,
        /// Vertices in counter-clockwise order, first vertex not repeated.
        vertices: Vec<Point>,
        /// Same ring as a `geo` polygon, for containment queries.
        polygon: geo::Polygon<f64>,
    },
}

impl ShapeOutline {
    /// Build the outline for `shape` at `diameter_mm`.
    ///
    /// The square is axis-aligned with side `diameter_mm`. Hexagon and
    /// octagon are regular, with circumradius `diameter_mm / 2` and the
    /// first vertex on the positive x axis.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameters`] if the diameter is not
    /// a positive finite number.
    pub fn new(shape: CoinShape, diameter_mm: f64) -> Result<Self, PipelineError> {
        if !diameter_mm.is_finite() || diameter_mm <= 0.0 {
            return Err(PipelineError::InvalidParameters(format!(
                "outline diameter must be positive, got {diameter_mm}"
            )));
        }
        let radius = diameter_mm / 2.0;
        let vertices = match shape {
            CoinShape::Circle => return Ok(Self::Circle { radius }),
            CoinShape::Square => vec![
                Point::new(radius, radius),
                Point::new(-radius, radius),
                Point::new(-radius, -radius),
                Point::new(radius, -radius),
            ],
            CoinShape::Hexagon => regular_polygon(6, radius),
            CoinShape::Octagon => regular_polygon(8, radius),
        };
        let ring: Vec<geo::Coord<f64>> = vertices.iter().copied().map(point_to_coord).collect();
        let polygon = geo::Polygon::new(geo::LineString::from(ring), vec![]);
        Ok(Self::Polygon {
            shape,
            vertices,
            polygon,
        })
    }

    /// The shape this outline was built for.
    #[must_use]
    pub const fn shape(&self) -> CoinShape {
        match self {
            Self::Circle { .. } => CoinShape::Circle,
            Self::Polygon { shape, .. } => *shape,
        }
    }

    /// Polygon vertices, or `None` for the analytic circle.
    #[must_use]
    pub fn vertices(&self) -> Option<&[Point]> {
        match self {
            Self::Circle { .. } => None,
            Self::Polygon { vertices, .. } => Some(vertices),
        }
    }

    /// Distance from the centre to the farthest boundary point.
    #[must_use]
    pub fn circumradius(&self) -> f64 {
        match self {
            Self::Circle { radius } => *radius,
            Self::Polygon { vertices, .. } => vertices
                .iter()
                .map(|v| v.distance(Point::new(0.0, 0.0)))
                .fold(0.0, f64::max),
        }
    }

    /// Signed area; positive for counter-clockwise outlines.
    #[must_use]
    pub fn signed_area(&self) -> f64 {
        match self {
            Self::Circle { radius } => std::f64::consts::PI * radius * radius,
            Self::Polygon { polygon, .. } => polygon.signed_area(),
        }
    }

    /// Whether `p` lies inside or on the outline.
    #[must_use]
    pub fn contains(&self, p: Point) -> bool {
        match self {
            Self::Circle { radius } => p.distance_squared(Point::new(0.0, 0.0)) <= radius * radius,
            Self::Polygon { polygon, .. } => polygon.intersects(&geo::Point::new(p.x, p.y)),
        }
    }

    /// A closed, counter-clockwise ring of at least `min_points` boundary
    /// points (first point not repeated).
    ///
    /// Circles are sampled at equal angles starting on the positive x
    /// axis. Polygons keep every vertex and subdivide each edge evenly,
    /// so corners are never cut.
    #[must_use]
    pub fn boundary_points(&self, min_points: usize) -> Vec<Point> {
        match self {
            Self::Circle { radius } => {
                let n = min_points.max(3);
                (0..n)
                    .map(|j| {
                        #[allow(clippy::cast_precision_loss)]
                        let theta = TAU * j as f64 / n as f64;
                        Point::new(radius * theta.cos(), radius * theta.sin())
                    })
                    .collect()
            }
            Self::Polygon { vertices, .. } => {
                let n = vertices.len();
                let per_edge = min_points.div_ceil(n).max(1);
                let mut out = Vec::with_capacity(n * per_edge);
                for (i, &a) in vertices.iter().enumerate() {
                    let b = vertices[(i + 1) % n];
                    for k in 0..per_edge {
                        #[allow(clippy::cast_precision_loss)]
                        let t = k as f64 / per_edge as f64;
                        out.push(Point::new(
                            (b.x - a.x).mul_add(t, a.x),
                            (b.y - a.y).mul_add(t, a.y),
                        ));
                    }
                }
                out
            }
        }
    }
}

/// Regular `n`-gon with circumradius `radius`, first vertex at angle 0,
/// counter-clockwise.
fn regular_polygon(n: usize, radius: f64) -> Vec<Point> {
    (0..n)
        .map(|k| {
            #[allow(clippy::cast_precision_loss)]
            let theta = TAU * k as f64 / n as f64;
            Point::new(radius * theta.cos(), radius * theta.sin())
        })
        .collect()
}
