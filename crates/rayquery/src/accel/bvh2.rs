use bytemuck::{Pod, Zeroable};

use crate::{geometry::AABB, primitives::PrimitiveKind};

/// Terminates traversal when found in `skip`
pub const INVALID_INDEX: u32 = u32::MAX;

const LEAF_FLAG: u32 = 1 << 0;

/// Device-layout BVH node in depth-first order.
///
/// The left child of an inner node is the node right after it. `skip` is where traversal
/// continues when the box is missed or the leaf has been processed, so a single program
/// counter is enough to walk the tree.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct LinearizedBVHNode {
    pub bounds_min: [f32; 3],
    pub skip: u32,
    pub bounds_max: [f32; 3],
    /// Offset into the index's primitive index list (leaves only)
    pub prim_start: u32,
    pub prim_count: u32,
    pub flags: u32,
    _padding: [u32; 2],
}

impl LinearizedBVHNode {
    pub fn inner(bounds: AABB, skip: u32) -> LinearizedBVHNode {
        LinearizedBVHNode {
            bounds_min: bounds.minimum.into(),
            skip,
            bounds_max: bounds.maximum.into(),
            prim_start: 0,
            prim_count: 0,
            flags: 0,
            _padding: [0; 2],
        }
    }

    pub fn leaf(bounds: AABB, skip: u32, prim_start: u32, prim_count: u32) -> LinearizedBVHNode {
        LinearizedBVHNode {
            bounds_min: bounds.minimum.into(),
            skip,
            bounds_max: bounds.maximum.into(),
            prim_start,
            prim_count,
            flags: LEAF_FLAG,
            _padding: [0; 2],
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & LEAF_FLAG != 0
    }

    pub fn bounds(&self) -> AABB {
        AABB::new(self.bounds_min.into(), self.bounds_max.into())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub nodes: usize,
    pub leaves: usize,
    /// Root alone has depth 1
    pub depth: usize,
    pub largest_leaf: usize,
    /// Primitives referenced by leaves; degenerate primitives are not counted
    pub primitives: usize,
}

/// Immutable spatial index over the primitives of one kind in a `PrimitiveStore`
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    pub(crate) kind: PrimitiveKind,
    pub(crate) nodes: Vec<LinearizedBVHNode>,
    pub(crate) primitive_indices: Vec<u32>,
    pub(crate) stats: IndexStats,
    pub(crate) source_version: u64,
}

impl SpatialIndex {
    pub fn kind(&self) -> PrimitiveKind {
        self.kind
    }

    pub fn nodes(&self) -> &[LinearizedBVHNode] {
        &self.nodes
    }

    /// Leaf ranges index into this list, which holds store indices
    pub fn primitive_indices(&self) -> &[u32] {
        &self.primitive_indices
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    /// Version of the `PrimitiveStore` this index was built from
    pub fn source_version(&self) -> u64 {
        self.source_version
    }

    pub fn bounds(&self) -> AABB {
        self.nodes.first().map(|n| n.bounds()).unwrap_or_default()
    }

    /// Store indices of the primitives in leaf `node_idx`
    pub fn leaf_primitives(&self, node_idx: usize) -> &[u32] {
        match self.nodes.get(node_idx) {
            Some(node) if node.is_leaf() => {
                let start = node.prim_start as usize;
                &self.primitive_indices[start..start + node.prim_count as usize]
            }
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_layout() {
        assert_eq!(std::mem::size_of::<LinearizedBVHNode>(), 48);
        assert_eq!(std::mem::align_of::<LinearizedBVHNode>(), 4);
    }

    #[test]
    fn test_leaf_flag() {
        let bounds = AABB::empty();
        assert!(LinearizedBVHNode::leaf(bounds, INVALID_INDEX, 0, 0).is_leaf());
        assert!(!LinearizedBVHNode::inner(bounds, INVALID_INDEX).is_leaf());
    }
}
