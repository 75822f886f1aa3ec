//! coinpress-export: Pure mesh serializers (sans-IO)
//!
//! Converts coinpress meshes into output formats. Currently supports
//! binary STL, in both directions.

pub mod stl;

pub use stl::{StlDocument, StlError, StlTriangle, from_stl, to_stl};
