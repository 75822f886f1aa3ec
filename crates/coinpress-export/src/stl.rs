//! Binary STL serializer and reader.
//!
//! Layout (all little-endian):
//!
//! ```text
//! [80-byte header][u32 triangle count]
//! per triangle: [f32 normal x3][f32 vertex x9][u16 attribute byte count]
//! ```
//!
//! Units are whatever the mesh uses; coinpress meshes are millimetres.
//! This is a pure module with no I/O: it works on byte buffers.

use coinpress_pipeline::{Bounds, Mesh};

/// Size of the fixed STL header.
pub const HEADER_LEN: usize = 80;
/// Bytes per serialized triangle.
pub const TRIANGLE_LEN: usize = 50;

/// Errors reading a binary STL buffer.
#[derive(Debug, thiserror::Error)]
pub enum StlError {
    /// The buffer is shorter than the header and count.
    #[error("STL data truncated: {0} bytes, need at least 84")]
    Truncated(usize),

    /// The buffer length disagrees with the declared triangle count.
    #[error("STL declares {declared} triangles but holds {actual} bytes of triangle data")]
    CountMismatch {
        /// Triangle count from the header.
        declared: u32,
        /// Bytes after the header.
        actual: usize,
    },

    /// A mesh had more triangles than the format can count.
    #[error("mesh has {0} triangles, more than binary STL can hold")]
    TooManyTriangles(usize),

    /// A triangle refers to a vertex the mesh does not have.
    #[error("triangle {0} references a missing vertex")]
    DanglingIndex(usize),
}

/// One facet as stored in the file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StlTriangle {
    /// Facet normal as written by the producer.
    pub normal: [f32; 3],
    /// Corner positions.
    pub vertices: [[f32; 3]; 3],
}

/// A parsed binary STL document.
#[derive(Debug, Clone, PartialEq)]
pub struct StlDocument {
    /// Header text with trailing NULs and spaces removed.
    pub header: String,
    /// All facets in file order.
    pub triangles: Vec<StlTriangle>,
}

impl StlDocument {
    /// Bounding box over all facet corners, or `None` when empty.
    #[must_use]
    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::of_points(self.triangles.iter().flat_map(|t| t.vertices))
    }
}

fn facet_normal([a, b, c]: [[f32; 3]; 3]) -> [f32; 3] {
    let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let n = [
        u[1].mul_add(v[2], -(u[2] * v[1])),
        u[2].mul_add(v[0], -(u[0] * v[2])),
        u[0].mul_add(v[1], -(u[1] * v[0])),
    ];
    let len = n[0].mul_add(n[0], n[1].mul_add(n[1], n[2] * n[2])).sqrt();
    if len > 0.0 {
        [n[0] / len, n[1] / len, n[2] / len]
    } else {
        [0.0, 0.0, 0.0]
    }
}

/// Serialize `mesh` to binary STL.
///
/// `header` is truncated to 80 bytes and NUL-padded. It must not start
/// with `solid`, which some readers take as the ASCII variant; such a
/// header is prefixed with `binary `.
///
/// # Errors
///
/// Returns [`StlError::TooManyTriangles`] if the triangle count does not
/// fit in a `u32`, or [`StlError::DanglingIndex`] if a triangle cannot be
/// resolved, since the declared count would then disagree with the body.
pub fn to_stl(mesh: &Mesh, header: &str) -> Result<Vec<u8>, StlError> {
    if let Some(index) = mesh.dangling_triangle() {
        return Err(StlError::DanglingIndex(index));
    }
    let count = u32::try_from(mesh.triangle_count())
        .map_err(|_| StlError::TooManyTriangles(mesh.triangle_count()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + 4 + mesh.triangle_count() * TRIANGLE_LEN);

    let mut head = [0u8; HEADER_LEN];
    let text = if header.trim_start().starts_with("solid") {
        format!("binary {header}")
    } else {
        header.to_string()
    };
    let n = text.len().min(HEADER_LEN);
    head[..n].copy_from_slice(&text.as_bytes()[..n]);
    out.extend_from_slice(&head);
    out.extend_from_slice(&count.to_le_bytes());

    for corners in mesh.triangle_positions() {
        for component in facet_normal(corners) {
            out.extend_from_slice(&component.to_le_bytes());
        }
        for vertex in corners {
            for component in vertex {
                out.extend_from_slice(&component.to_le_bytes());
            }
        }
        out.extend_from_slice(&0u16.to_le_bytes());
    }

    Ok(out)
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    f32::from_le_bytes(buf)
}

/// Parse a binary STL buffer.
///
/// # Errors
///
/// Returns [`StlError::Truncated`] or [`StlError::CountMismatch`] when the
/// buffer is not a well-formed binary STL.
pub fn from_stl(bytes: &[u8]) -> Result<StlDocument, StlError> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(StlError::Truncated(bytes.len()));
    }
    let header = String::from_utf8_lossy(&bytes[..HEADER_LEN])
        .trim_end_matches(['\0', ' '])
        .to_string();

    let mut count_buf = [0u8; 4];
    count_buf.copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + 4]);
    let declared = u32::from_le_bytes(count_buf);

    let body = &bytes[HEADER_LEN + 4..];
    let expected = usize::try_from(declared)
        .ok()
        .and_then(|n| n.checked_mul(TRIANGLE_LEN));
    if expected != Some(body.len()) {
        return Err(StlError::CountMismatch {
            declared,
            actual: body.len(),
        });
    }

    let triangles = body
        .chunks_exact(TRIANGLE_LEN)
        .map(|chunk| {
            let v = |i: usize| {
                [
                    read_f32(chunk, i * 12),
                    read_f32(chunk, i * 12 + 4),
                    read_f32(chunk, i * 12 + 8),
                ]
            };
            StlTriangle {
                normal: v(0),
                vertices: [v(1), v(2), v(3)],
            }
        })
        .collect();

    Ok(StlDocument { header, triangles })
}
