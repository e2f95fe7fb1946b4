use std::sync::Arc;

use tracing::debug;

use super::{
    traverse::{HitRange, LeafBuffers, LeafTest, QueryOutput},
    IndexBinding, Intersector, PreparedScene, RayQuery,
};
use crate::{
    accel::SpatialIndex,
    device::{Buffer, Device, Event},
    error::{Error, Result},
    geometry::Vec3,
    primitives::{PrimitiveKind, TrianglePrimitive, UploadedPrimitives},
    ray::{Hit, Ray, RayFlags},
    settings::QueryOptions,
};

/// Moller-Trumbore; returns (t, u, v). With `cull_backfaces` only triangles wound
/// counter-clockwise as seen along the ray are hit.
pub(crate) fn ray_triangle_intersect(
    p0: Vec3,
    p1: Vec3,
    p2: Vec3,
    origin: Vec3,
    direction: Vec3,
    cull_backfaces: bool,
) -> Option<Vec3> {
    let e1 = p1 - p0;
    let e2 = p2 - p0;

    let p = Vec3::cross(direction, e2);
    let denom = Vec3::dot(p, e1);

    if denom == 0.0 || (cull_backfaces && denom < 0.0) {
        return None;
    }

    let t_vec = origin - p0;
    let u = Vec3::dot(p, t_vec) / denom;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = Vec3::cross(t_vec, e1);
    let v = Vec3::dot(q, direction) / denom;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = Vec3::dot(q, e2) / denom;
    Some(Vec3(t, u, v))
}

pub(crate) struct TriangleLeaves<'a> {
    pub(crate) primitives: &'a [TrianglePrimitive],
}

impl LeafTest for TriangleLeaves<'_> {
    fn intersect(&self, prim: u32, ray: &Ray, range: &HitRange) -> Option<Hit> {
        let tri = self.primitives.get(prim as usize)?;
        if tri.mask & ray.mask == 0 {
            return None;
        }

        let (p0, p1, p2) = tri.vertices();
        let cull = ray.flags().contains(RayFlags::CULL_BACKFACES);
        let tuv = ray_triangle_intersect(p0, p1, p2, ray.origin(), ray.direction(), cull)?;
        if !range.accepts(tuv.0) {
            return None;
        }

        Some(Hit::new(tri.shape_id, tri.prim_id, [tuv.1, tuv.2], tuv.0))
    }
}

struct TriangleBinding {
    index: IndexBinding,
    primitives: Buffer<TrianglePrimitive>,
}

pub struct TriangleIntersector {
    device: Arc<Device>,
    options: QueryOptions,
    binding: Option<TriangleBinding>,
}

impl TriangleIntersector {
    pub fn new(device: Arc<Device>, options: QueryOptions) -> TriangleIntersector {
        TriangleIntersector {
            device,
            options,
            binding: None,
        }
    }

    pub fn set_options(&mut self, options: QueryOptions) {
        self.options = options;
    }

    /// Binds an index and already uploaded primitives. The previous binding is kept if this fails.
    pub fn bind(&mut self, index: &SpatialIndex, primitives: &UploadedPrimitives) -> Result<()> {
        let index_binding = IndexBinding::upload(&self.device, PrimitiveKind::Triangle, index, primitives)?;
        let triangles = primitives.triangles.clone().ok_or(Error::EmptyScene)?;
        self.device.check_buffer(&triangles)?;

        debug!(
            "{}: bound triangle index with {} nodes",
            self.device.name(),
            index.nodes().len()
        );
        self.binding = Some(TriangleBinding {
            index: index_binding,
            primitives: triangles,
        });
        Ok(())
    }

    fn binding(&self) -> Result<&TriangleBinding> {
        self.binding.as_ref().ok_or(Error::NotProcessed)
    }

    fn leaves(&self) -> Result<LeafBuffers> {
        Ok(LeafBuffers::Triangles {
            primitives: self.binding()?.primitives.clone(),
        })
    }
}

impl Intersector for TriangleIntersector {
    fn kind(&self) -> PrimitiveKind {
        PrimitiveKind::Triangle
    }

    fn process(&mut self, scene: &PreparedScene) -> Result<()> {
        let index = scene.index(PrimitiveKind::Triangle).ok_or(Error::EmptyScene)?;
        let uploaded = scene.store().upload_kind(&self.device, PrimitiveKind::Triangle)?;
        self.bind(index, &uploaded)
    }

    fn is_processed(&self) -> bool {
        self.binding.is_some()
    }

    fn intersect(&self, query: &RayQuery, hits: &Buffer<Hit>) -> Result<Event> {
        let binding = self.binding()?;
        let launch = binding.index.launch(
            query,
            self.leaves()?,
            QueryOutput::Closest(hits.clone()),
            hits.len(),
            &self.options,
        )?;
        self.device.launch(query.queue, launch, query.wait.as_ref())
    }

    fn occluded(&self, query: &RayQuery, occlusion: &Buffer<u32>) -> Result<Event> {
        let binding = self.binding()?;
        let launch = binding.index.launch(
            query,
            self.leaves()?,
            QueryOutput::Any(occlusion.clone()),
            occlusion.len(),
            &self.options,
        )?;
        self.device.launch(query.queue, launch, query.wait.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-5;

    fn assert_approx_eq(a: f32, b: f32) {
        assert!((a - b).abs() < EPSILON, "{} != {}", a, b);
    }

    fn unit_triangle() -> (Vec3, Vec3, Vec3) {
        (Vec3(0.0, 0.0, 0.0), Vec3(1.0, 0.0, 0.0), Vec3(0.0, 1.0, 0.0))
    }

    #[test]
    fn test_hit_reports_distance_and_barycentrics() {
        let (p0, p1, p2) = unit_triangle();
        let tuv = ray_triangle_intersect(
            p0,
            p1,
            p2,
            Vec3(0.25, 0.5, 2.0),
            Vec3(0.0, 0.0, -1.0),
            false,
        )
        .unwrap();
        assert_approx_eq(tuv.0, 2.0);
        assert_approx_eq(tuv.1, 0.25);
        assert_approx_eq(tuv.2, 0.5);
    }

    #[test]
    fn test_miss_outside_edges() {
        let (p0, p1, p2) = unit_triangle();
        let origin = Vec3(0.8, 0.8, 1.0);
        assert!(ray_triangle_intersect(p0, p1, p2, origin, Vec3(0.0, 0.0, -1.0), false).is_none());
    }

    #[test]
    fn test_backface_culling() {
        let (p0, p1, p2) = unit_triangle();
        let from_front = Vec3(0.2, 0.2, 1.0);
        let from_back = Vec3(0.2, 0.2, -1.0);
        assert!(ray_triangle_intersect(p0, p1, p2, from_front, Vec3(0.0, 0.0, -1.0), true).is_some());
        assert!(ray_triangle_intersect(p0, p1, p2, from_back, Vec3(0.0, 0.0, 1.0), true).is_none());
        assert!(ray_triangle_intersect(p0, p1, p2, from_back, Vec3(0.0, 0.0, 1.0), false).is_some());
    }

    #[test]
    fn test_leaf_respects_mask_and_range() {
        let (p0, p1, p2) = unit_triangle();
        let tri = TrianglePrimitive {
            v0: p0.into(),
            shape_id: 3,
            v1: p1.into(),
            prim_id: 0,
            v2: p2.into(),
            mask: 0b01,
        };
        let leaves = TriangleLeaves { primitives: &[tri] };
        let ray = Ray::new(Vec3(0.2, 0.2, 1.0), Vec3(0.0, 0.0, -1.0));

        let range = HitRange {
            tmin: ray.tmin,
            tmax: ray.tmax,
            inclusive_tmin: false,
            exclusive_tmax: false,
        };
        assert_eq!(leaves.intersect(0, &ray, &range).map(|h| h.shape_id), Some(3));
        assert!(leaves.intersect(0, &ray.with_mask(0b10), &range).is_none());

        let short = HitRange { tmax: 0.5, ..range };
        assert!(leaves.intersect(0, &ray, &short).is_none());
    }
}
