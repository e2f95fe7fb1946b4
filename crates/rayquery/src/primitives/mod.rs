//! Scene geometry flattened into device-uploadable arrays
//!
//! Shapes (meshes, curve sets) are broken down into individual primitives (triangles, curve
//! segments). Every primitive keeps the id of the shape it came from together with its index
//! inside that shape, so hits can be reported against the caller's own numbering even though the
//! spatial index reorders primitives freely.

mod curves;
mod mesh;
mod store;

pub use curves::Curves;
pub use mesh::Mesh;
pub use store::{CurveSegment, PrimitiveStore, TrianglePrimitive, UploadedPrimitives};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimitiveKind {
    Triangle,
    Curve,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 2] = [PrimitiveKind::Triangle, PrimitiveKind::Curve];
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveKind::Triangle => write!(f, "triangle"),
            PrimitiveKind::Curve => write!(f, "curve"),
        }
    }
}

/// What to do with primitives that can never be hit (zero area, zero radius, non-finite)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DegeneratePolicy {
    /// Keep them in the store but give them no bounds; the builder skips them
    #[default]
    Keep,
    /// Fail the append with `InvalidGeometry`
    Reject,
}
