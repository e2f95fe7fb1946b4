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
    primitives::{CurveSegment, PrimitiveKind, UploadedPrimitives},
    ray::{Hit, Ray},
    settings::QueryOptions,
};

/// Ray against a capsule (a cylinder from `p0` to `p1` capped with spheres). Returns the
/// nearest accepted `t` together with the position along the segment in `[0, 1]`.
pub(crate) fn ray_capsule_intersect(
    p0: Vec3,
    p1: Vec3,
    radius: f32,
    origin: Vec3,
    direction: Vec3,
    range: &HitRange,
) -> Option<(f32, f32)> {
    let ba = p1 - p0;
    let oa = origin - p0;

    let baba = Vec3::dot(ba, ba);
    let bard = Vec3::dot(ba, direction);
    let baoa = Vec3::dot(ba, oa);
    let rdoa = Vec3::dot(direction, oa);
    let oaoa = Vec3::dot(oa, oa);
    let rdrd = Vec3::dot(direction, direction);
    let r2 = radius * radius;

    let mut best: Option<(f32, f32)> = None;
    let mut consider = |t: f32, s: f32| {
        if range.accepts(t) && best.map_or(true, |(best_t, _)| t < best_t) {
            best = Some((t, s.clamp(0.0, 1.0)));
        }
    };

    // body; `y` is the projection of the hit point on the axis, scaled by |ba|^2
    let a = baba * rdrd - bard * bard;
    let b = baba * rdoa - baoa * bard;
    let c = baba * oaoa - baoa * baoa - r2 * baba;
    let h = b * b - a * c;
    if a != 0.0 && h >= 0.0 {
        let h = h.sqrt();
        for t in [(-b - h) / a, (-b + h) / a] {
            let y = baoa + t * bard;
            if y > 0.0 && y < baba {
                consider(t, y / baba);
            }
        }
    }

    // caps; only the part of each sphere outside the body belongs to the surface
    for (center, s) in [(p0, 0.0), (p1, 1.0)] {
        let oc = origin - center;
        let half_b = Vec3::dot(oc, direction);
        let c = Vec3::dot(oc, oc) - r2;
        let disc = half_b * half_b - rdrd * c;
        if rdrd == 0.0 || disc < 0.0 {
            continue;
        }
        let disc = disc.sqrt();
        for t in [(-half_b - disc) / rdrd, (-half_b + disc) / rdrd] {
            let y = baoa + t * bard;
            let on_cap = if s == 0.0 { y <= 0.0 } else { y >= baba };
            if on_cap {
                consider(t, s);
            }
        }
    }

    best
}

pub(crate) struct CurveLeaves<'a> {
    pub(crate) segments: &'a [CurveSegment],
    pub(crate) radii: &'a [f32],
}

impl LeafTest for CurveLeaves<'_> {
    fn intersect(&self, prim: u32, ray: &Ray, range: &HitRange) -> Option<Hit> {
        let segment = self.segments.get(prim as usize)?;
        let radius = *self.radii.get(prim as usize)?;
        if segment.mask & ray.mask == 0 {
            return None;
        }

        let (p0, p1) = segment.endpoints();
        let (t, s) = ray_capsule_intersect(p0, p1, radius, ray.origin(), ray.direction(), range)?;
        Some(Hit::new(segment.shape_id, segment.prim_id, [s, 0.0], t))
    }
}

struct CurveBinding {
    index: IndexBinding,
    segments: Buffer<CurveSegment>,
    radii: Buffer<f32>,
}

/// Intersector for curve segments; owns the auxiliary radius buffer alongside the segments
pub struct CurveIntersector {
    device: Arc<Device>,
    options: QueryOptions,
    binding: Option<CurveBinding>,
}

impl CurveIntersector {
    pub fn new(device: Arc<Device>, options: QueryOptions) -> CurveIntersector {
        CurveIntersector {
            device,
            options,
            binding: None,
        }
    }

    pub fn set_options(&mut self, options: QueryOptions) {
        self.options = options;
    }

    pub fn bind(&mut self, index: &SpatialIndex, primitives: &UploadedPrimitives) -> Result<()> {
        let index_binding = IndexBinding::upload(&self.device, PrimitiveKind::Curve, index, primitives)?;
        let segments = primitives.curves.clone().ok_or(Error::EmptyScene)?;
        let radii = primitives.curve_radii.clone().ok_or(Error::EmptyScene)?;
        self.device.check_buffer(&segments)?;
        self.device.check_buffer(&radii)?;

        debug!(
            "{}: bound curve index with {} nodes",
            self.device.name(),
            index.nodes().len()
        );
        self.binding = Some(CurveBinding {
            index: index_binding,
            segments,
            radii,
        });
        Ok(())
    }

    fn binding(&self) -> Result<&CurveBinding> {
        self.binding.as_ref().ok_or(Error::NotProcessed)
    }

    fn leaves(&self) -> Result<LeafBuffers> {
        let binding = self.binding()?;
        Ok(LeafBuffers::Curves {
            segments: binding.segments.clone(),
            radii: binding.radii.clone(),
        })
    }
}

impl Intersector for CurveIntersector {
    fn kind(&self) -> PrimitiveKind {
        PrimitiveKind::Curve
    }

    fn process(&mut self, scene: &PreparedScene) -> Result<()> {
        let index = scene.index(PrimitiveKind::Curve).ok_or(Error::EmptyScene)?;
        let uploaded = scene.store().upload_kind(&self.device, PrimitiveKind::Curve)?;
        self.bind(index, &uploaded)
    }

    fn is_processed(&self) -> bool {
        self.binding.is_some()
    }

    fn intersect(&self, query: &RayQuery, hits: &Buffer<Hit>) -> Result<Event> {
        let launch = self.binding()?.index.launch(
            query,
            self.leaves()?,
            QueryOutput::Closest(hits.clone()),
            hits.len(),
            &self.options,
        )?;
        self.device.launch(query.queue, launch, query.wait.as_ref())
    }

    fn occluded(&self, query: &RayQuery, occlusion: &Buffer<u32>) -> Result<Event> {
        let launch = self.binding()?.index.launch(
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

    const EPSILON: f32 = 1e-4;

    fn assert_approx_eq(a: f32, b: f32) {
        assert!((a - b).abs() < EPSILON, "{} != {}", a, b);
    }

    fn open_range() -> HitRange {
        HitRange {
            tmin: 0.0,
            tmax: f32::INFINITY,
            inclusive_tmin: false,
            exclusive_tmax: false,
        }
    }

    // vertical capsule of radius 0.5 from y=0 to y=2
    fn capsule(origin: Vec3, direction: Vec3, range: &HitRange) -> Option<(f32, f32)> {
        ray_capsule_intersect(Vec3(0.0, 0.0, 0.0), Vec3(0.0, 2.0, 0.0), 0.5, origin, direction, range)
    }

    #[test]
    fn test_body_hit() {
        let (t, s) = capsule(Vec3(0.0, 1.0, 5.0), Vec3(0.0, 0.0, -1.0), &open_range()).unwrap();
        assert_approx_eq(t, 4.5);
        assert_approx_eq(s, 0.5);
    }

    #[test]
    fn test_unnormalized_direction_scales_t() {
        let (t, _) = capsule(Vec3(0.0, 1.0, 5.0), Vec3(0.0, 0.0, -2.0), &open_range()).unwrap();
        assert_approx_eq(t, 2.25);
    }

    #[test]
    fn test_cap_hit() {
        let (t, s) = capsule(Vec3(0.0, 5.0, 0.0), Vec3(0.0, -1.0, 0.0), &open_range()).unwrap();
        assert_approx_eq(t, 2.5);
        assert_approx_eq(s, 1.0);
    }

    #[test]
    fn test_origin_inside_takes_far_surface() {
        let (t, _) = capsule(Vec3(0.0, 1.0, 0.0), Vec3(1.0, 0.0, 0.0), &open_range()).unwrap();
        assert_approx_eq(t, 0.5);
    }

    #[test]
    fn test_miss_and_range() {
        assert!(capsule(Vec3(2.0, 1.0, 5.0), Vec3(0.0, 0.0, -1.0), &open_range()).is_none());
        let short = HitRange {
            tmax: 4.0,
            ..open_range()
        };
        assert!(capsule(Vec3(0.0, 1.0, 5.0), Vec3(0.0, 0.0, -1.0), &short).is_none());
    }
}
