//! Acceleration structure
//! A binary BVH built on the host with a bucketed SAH and flattened into a skip-link layout, so
//! both the host traversal and the OpenCL kernels walk it without a stack.

pub mod builder;
pub mod bvh2;

pub use builder::{BuildSettings, SpatialIndexBuilder, SplitMethod};
pub use bvh2::{IndexStats, LinearizedBVHNode, SpatialIndex, INVALID_INDEX};
