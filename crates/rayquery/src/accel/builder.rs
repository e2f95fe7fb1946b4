use std::time::Instant;

use tracing::{info, trace_span};

use super::bvh2::{IndexStats, LinearizedBVHNode, SpatialIndex, INVALID_INDEX};
use crate::{
    error::{Error, Result},
    geometry::{Axis, AABB},
    primitives::{PrimitiveKind, PrimitiveStore},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SplitMethod {
    /// Bucketed surface area heuristic
    #[default]
    Sah,
    /// Split at the median centroid along the dominant axis
    Median,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildSettings {
    pub split_method: SplitMethod,
    pub bin_count: usize,
    /// Cost of visiting an inner node relative to one primitive test
    pub traversal_cost: f32,
    pub max_leaf_size: usize,
    pub max_depth: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        BuildSettings {
            split_method: SplitMethod::Sah,
            bin_count: 16,
            traversal_cost: 1.0,
            max_leaf_size: 4,
            max_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PrimRef {
    index: u32,
    bounds: AABB,
    centroid: [f32; 3],
}

impl PrimRef {
    fn centroid(&self, axis: Axis) -> f32 {
        self.centroid[axis as usize]
    }
}

enum BuildNodeKind {
    Leaf { start: u32, count: u32 },
    Inner { left: usize, right: usize },
}

struct BuildNode {
    bounds: AABB,
    kind: BuildNodeKind,
    /// Number of nodes in the subtree rooted here, this node included
    size: u32,
}

enum SplitDecision {
    Leaf,
    At(usize),
    Degenerate,
}

#[derive(Clone, Copy)]
struct Bucket {
    count: usize,
    bounds: AABB,
}

/// Builds `SpatialIndex`es. Holds only settings, so a failed build leaves nothing behind.
#[derive(Debug, Clone, Default)]
pub struct SpatialIndexBuilder {
    settings: BuildSettings,
}

impl SpatialIndexBuilder {
    pub fn new(settings: BuildSettings) -> SpatialIndexBuilder {
        SpatialIndexBuilder { settings }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn build_triangles(&self, store: &PrimitiveStore) -> Result<SpatialIndex> {
        self.build(
            PrimitiveKind::Triangle,
            store.bounds(PrimitiveKind::Triangle),
            store.version(),
        )
    }

    pub fn build_curves(&self, store: &PrimitiveStore) -> Result<SpatialIndex> {
        self.build(
            PrimitiveKind::Curve,
            store.bounds(PrimitiveKind::Curve),
            store.version(),
        )
    }

    /// Builds an index over `bounds`; `None` entries are degenerate and left out
    pub fn build(
        &self,
        kind: PrimitiveKind,
        bounds: &[Option<AABB>],
        source_version: u64,
    ) -> Result<SpatialIndex> {
        if bounds.is_empty() {
            return Err(Error::EmptyScene);
        }

        let _span = trace_span!("build_index", %kind, primitives = bounds.len()).entered();
        let start_time = Instant::now();

        let mut refs: Vec<PrimRef> = bounds
            .iter()
            .enumerate()
            .filter_map(|(index, b)| {
                b.map(|bounds| PrimRef {
                    index: index as u32,
                    bounds,
                    centroid: bounds.centroid().into(),
                })
            })
            .collect();

        let mut arena = Vec::with_capacity(2 * refs.len() / self.settings.max_leaf_size.max(1) + 1);
        let root = if refs.is_empty() {
            arena.push(BuildNode {
                bounds: AABB::empty(),
                kind: BuildNodeKind::Leaf { start: 0, count: 0 },
                size: 1,
            });
            0
        } else {
            self.build_recursive(&mut refs, 0, 1, &mut arena)
        };

        let primitive_indices: Vec<u32> = refs.iter().map(|r| r.index).collect();
        let (nodes, mut stats) = flatten(&arena, root);
        stats.primitives = primitive_indices.len();

        info!(
            "built {} index over {} primitives in {:?}: {} nodes, {} leaves, depth {}, largest leaf {}",
            kind,
            stats.primitives,
            start_time.elapsed(),
            stats.nodes,
            stats.leaves,
            stats.depth,
            stats.largest_leaf
        );

        Ok(SpatialIndex {
            kind,
            nodes,
            primitive_indices,
            stats,
            source_version,
        })
    }

    // `refs` is the slice for this subtree; `offset` is where it starts in the full list
    fn build_recursive(
        &self,
        refs: &mut [PrimRef],
        offset: usize,
        depth: usize,
        arena: &mut Vec<BuildNode>,
    ) -> usize {
        let bounds = refs
            .iter()
            .fold(AABB::empty(), |acc, r| AABB::surrounding_box(acc, r.bounds));
        let count = refs.len();

        let make_leaf = |arena: &mut Vec<BuildNode>| {
            arena.push(BuildNode {
                bounds,
                kind: BuildNodeKind::Leaf {
                    start: offset as u32,
                    count: count as u32,
                },
                size: 1,
            });
            arena.len() - 1
        };

        if count <= self.settings.max_leaf_size || depth >= self.settings.max_depth {
            return make_leaf(arena);
        }

        let mut centroid_bounds = AABB::empty();
        for r in refs.iter() {
            centroid_bounds.grow(r.centroid.into());
        }
        let axis = centroid_bounds.extent().max_axis();

        let decision = match self.settings.split_method {
            SplitMethod::Sah => self.sah_split(refs, &bounds, &centroid_bounds, axis),
            SplitMethod::Median => SplitDecision::Degenerate,
        };

        let mid = match decision {
            SplitDecision::Leaf => return make_leaf(arena),
            SplitDecision::At(mid) => mid,
            SplitDecision::Degenerate => median_split(refs, axis),
        };

        let (left_refs, right_refs) = refs.split_at_mut(mid);
        let left = self.build_recursive(left_refs, offset, depth + 1, arena);
        let right = self.build_recursive(right_refs, offset + mid, depth + 1, arena);

        arena.push(BuildNode {
            bounds,
            kind: BuildNodeKind::Inner { left, right },
            size: 1 + arena[left].size + arena[right].size,
        });
        arena.len() - 1
    }

    /// Partitions `refs` when a split pays off. Buckets are compared by
    /// `left_area * left_count + right_area * right_count`; the lowest bucket wins ties.
    fn sah_split(
        &self,
        refs: &mut [PrimRef],
        bounds: &AABB,
        centroid_bounds: &AABB,
        axis: Axis,
    ) -> SplitDecision {
        let bin_count = self.settings.bin_count.max(2);
        let split_min = centroid_bounds.minimum.axis(axis);
        let split_len = centroid_bounds.extent().axis(axis);
        let parent_area = bounds.surface_area();

        if !(split_len > 0.0 && split_len.is_finite() && parent_area > 0.0 && parent_area.is_finite()) {
            return SplitDecision::Degenerate;
        }

        let scale = bin_count as f32 / split_len;
        let bucket_of = |r: &PrimRef| -> usize {
            let idx = ((r.centroid(axis) - split_min) * scale) as usize;
            idx.min(bin_count - 1)
        };

        let mut buckets = vec![
            Bucket {
                count: 0,
                bounds: AABB::empty()
            };
            bin_count
        ];
        for r in refs.iter() {
            let bucket = &mut buckets[bucket_of(r)];
            bucket.count += 1;
            bucket.bounds = AABB::surrounding_box(bucket.bounds, r.bounds);
        }

        // right_area[i] and right_count[i] cover buckets i..bin_count
        let mut right_area = vec![0.0; bin_count];
        let mut right_count = vec![0; bin_count];
        let mut acc = AABB::empty();
        let mut acc_count = 0;
        for i in (0..bin_count).rev() {
            acc = AABB::surrounding_box(acc, buckets[i].bounds);
            acc_count += buckets[i].count;
            right_area[i] = acc.surface_area();
            right_count[i] = acc_count;
        }

        let mut best: Option<(usize, f32)> = None;
        let mut left = AABB::empty();
        let mut left_count = 0;
        for i in 0..bin_count - 1 {
            left = AABB::surrounding_box(left, buckets[i].bounds);
            left_count += buckets[i].count;
            if left_count == 0 || right_count[i + 1] == 0 {
                continue;
            }
            let cost = left.surface_area() * left_count as f32
                + right_area[i + 1] * right_count[i + 1] as f32;
            if best.map_or(true, |(_, best_cost)| cost < best_cost) {
                best = Some((i, cost));
            }
        }

        let Some((split_bucket, cost)) = best else {
            return SplitDecision::Degenerate;
        };
        if !cost.is_finite() {
            return SplitDecision::Degenerate;
        }
        if self.settings.traversal_cost + cost / parent_area >= refs.len() as f32 {
            return SplitDecision::Leaf;
        }

        // stable partition keeps the relative order of primitives on each side
        refs.sort_by_key(|r| bucket_of(r) > split_bucket);
        let mid = refs.iter().take_while(|r| bucket_of(r) <= split_bucket).count();
        if mid == 0 || mid == refs.len() {
            return SplitDecision::Degenerate;
        }
        SplitDecision::At(mid)
    }
}

fn median_split(refs: &mut [PrimRef], axis: Axis) -> usize {
    refs.sort_by(|a, b| {
        a.centroid(axis)
            .total_cmp(&b.centroid(axis))
            .then(a.index.cmp(&b.index))
    });
    refs.len() / 2
}

/// Lays the arena out depth-first and assigns skip links.
fn flatten(arena: &[BuildNode], root: usize) -> (Vec<LinearizedBVHNode>, IndexStats) {
    let mut nodes = Vec::with_capacity(arena[root].size as usize);
    let mut stats = IndexStats::default();

    // (arena index, skip target, depth)
    let mut pending = vec![(root, INVALID_INDEX, 1usize)];
    while let Some((arena_idx, skip, depth)) = pending.pop() {
        let node = &arena[arena_idx];
        let output_idx = nodes.len() as u32;
        stats.depth = stats.depth.max(depth);

        match node.kind {
            BuildNodeKind::Leaf { start, count } => {
                nodes.push(LinearizedBVHNode::leaf(node.bounds, skip, start, count));
                stats.leaves += 1;
                stats.largest_leaf = stats.largest_leaf.max(count as usize);
            }
            BuildNodeKind::Inner { left, right } => {
                nodes.push(LinearizedBVHNode::inner(node.bounds, skip));
                let right_idx = output_idx + 1 + arena[left].size;
                // right is pushed first so the left subtree is emitted immediately after
                pending.push((right, skip, depth + 1));
                pending.push((left, right_idx, depth + 1));
            }
        }
    }

    stats.nodes = nodes.len();
    (nodes, stats)
}
