use std::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use bytemuck::{Pod, Zeroable};
use tracing::{debug, warn};

use super::{Curves, DegeneratePolicy, Mesh, PrimitiveKind};
use crate::{
    device::{Buffer, Device},
    error::{Error, Result},
    geometry::{Vec3, AABB},
    world::{Geometry, ShapeId, World},
};

// versions are unique across stores so an index can never be bound against a store it
// was not built from
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TrianglePrimitive {
    pub v0: [f32; 3],
    pub shape_id: u32,
    pub v1: [f32; 3],
    pub prim_id: u32,
    pub v2: [f32; 3],
    pub mask: u32,
}

impl TrianglePrimitive {
    pub fn vertices(&self) -> (Vec3, Vec3, Vec3) {
        (self.v0.into(), self.v1.into(), self.v2.into())
    }
}

/// Curve segment record; its radius lives in a separate auxiliary array
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CurveSegment {
    pub p0: [f32; 3],
    pub shape_id: u32,
    pub p1: [f32; 3],
    pub prim_id: u32,
    pub mask: u32,
    _padding: [u32; 3],
}

impl CurveSegment {
    pub fn new(p0: Vec3, p1: Vec3, shape_id: u32, prim_id: u32, mask: u32) -> CurveSegment {
        CurveSegment {
            p0: p0.into(),
            shape_id,
            p1: p1.into(),
            prim_id,
            mask,
            _padding: [0; 3],
        }
    }

    pub fn endpoints(&self) -> (Vec3, Vec3) {
        (self.p0.into(), self.p1.into())
    }
}

fn triangle_bounds(p0: Vec3, p1: Vec3, p2: Vec3) -> std::result::Result<AABB, &'static str> {
    if !(p0.is_finite() && p1.is_finite() && p2.is_finite()) {
        return Err("non-finite vertex");
    }
    if Vec3::cross(p1 - p0, p2 - p0).square_magnitude() == 0.0 {
        return Err("zero-area triangle");
    }
    Ok(AABB::triangle(p0, p1, p2))
}

fn capsule_bounds(p0: Vec3, p1: Vec3, radius: f32) -> std::result::Result<AABB, &'static str> {
    if !(p0.is_finite() && p1.is_finite()) {
        return Err("non-finite control point");
    }
    if !(radius.is_finite() && radius > 0.0) {
        return Err("non-positive curve radius");
    }
    let r = Vec3::splat(radius);
    Ok(AABB::new(
        Vec3::elementwise_min(p0, p1) - r,
        Vec3::elementwise_max(p0, p1) + r,
    ))
}

/// Append-only container of flattened primitives.
///
/// Bounds are kept per primitive; degenerate primitives kept under `DegeneratePolicy::Keep`
/// have `None` bounds and are left out of every spatial index built from the store.
#[derive(Debug, Clone)]
pub struct PrimitiveStore {
    policy: DegeneratePolicy,
    version: u64,

    triangles: Vec<TrianglePrimitive>,
    triangle_bounds: Vec<Option<AABB>>,

    curves: Vec<CurveSegment>,
    curve_radii: Vec<f32>,
    curve_bounds: Vec<Option<AABB>>,
}

impl PrimitiveStore {
    pub fn new(policy: DegeneratePolicy) -> PrimitiveStore {
        PrimitiveStore {
            policy,
            version: next_version(),
            triangles: Vec::new(),
            triangle_bounds: Vec::new(),
            curves: Vec::new(),
            curve_radii: Vec::new(),
            curve_bounds: Vec::new(),
        }
    }

    pub fn from_world(world: &World, policy: DegeneratePolicy) -> Result<PrimitiveStore> {
        let mut store = PrimitiveStore::new(policy);
        for shape in world.shapes() {
            match &shape.geometry {
                Geometry::Mesh(mesh) => store.append_mesh(shape.id, shape.mask, mesh)?,
                Geometry::Curves(curves) => store.append_curves(shape.id, shape.mask, curves)?,
            };
        }

        let degenerate: usize = PrimitiveKind::ALL.iter().map(|&k| store.degenerate_count(k)).sum();
        if degenerate > 0 {
            warn!("keeping {} degenerate primitives; they will never be hit", degenerate);
        }

        Ok(store)
    }

    /// Appends every triangle of `mesh`; on error the store is left untouched
    pub fn append_mesh(&mut self, shape: ShapeId, mask: u32, mesh: &Mesh) -> Result<Range<usize>> {
        let mut primitives = Vec::with_capacity(mesh.tri_count());
        let mut bounds = Vec::with_capacity(mesh.tri_count());

        for tri_idx in 0..mesh.tri_count() {
            let Some((p0, p1, p2)) = mesh.tri_vertices(tri_idx) else {
                return Err(Error::InvalidGeometry {
                    shape,
                    primitive: tri_idx as u32,
                    reason: "vertex index out of range",
                });
            };

            let tri_bounds = match (triangle_bounds(p0, p1, p2), self.policy) {
                (Ok(b), _) => Some(b),
                (Err(_), DegeneratePolicy::Keep) => None,
                (Err(reason), DegeneratePolicy::Reject) => {
                    return Err(Error::InvalidGeometry { shape, primitive: tri_idx as u32, reason });
                }
            };

            primitives.push(TrianglePrimitive {
                v0: p0.into(),
                shape_id: shape,
                v1: p1.into(),
                prim_id: tri_idx as u32,
                v2: p2.into(),
                mask,
            });
            bounds.push(tri_bounds);
        }

        let start = self.triangles.len();
        self.triangles.extend(primitives);
        self.triangle_bounds.extend(bounds);
        self.version = next_version();
        debug!("store: appended {} triangles for shape {}", self.triangles.len() - start, shape);

        Ok(start..self.triangles.len())
    }

    /// Appends every segment of `curves`; on error the store is left untouched
    pub fn append_curves(&mut self, shape: ShapeId, mask: u32, curves: &Curves) -> Result<Range<usize>> {
        let mut segments = Vec::with_capacity(curves.segment_count());
        let mut radii = Vec::with_capacity(curves.segment_count());
        let mut bounds = Vec::with_capacity(curves.segment_count());

        for segment_idx in 0..curves.segment_count() {
            let Some((p0, p1, radius)) = curves.segment(segment_idx) else {
                return Err(Error::InvalidGeometry {
                    shape,
                    primitive: segment_idx as u32,
                    reason: "control point index out of range",
                });
            };

            let segment_bounds = match (capsule_bounds(p0, p1, radius), self.policy) {
                (Ok(b), _) => Some(b),
                (Err(_), DegeneratePolicy::Keep) => None,
                (Err(reason), DegeneratePolicy::Reject) => {
                    return Err(Error::InvalidGeometry { shape, primitive: segment_idx as u32, reason });
                }
            };

            segments.push(CurveSegment::new(p0, p1, shape, segment_idx as u32, mask));
            radii.push(radius);
            bounds.push(segment_bounds);
        }

        let start = self.curves.len();
        self.curves.extend(segments);
        self.curve_radii.extend(radii);
        self.curve_bounds.extend(bounds);
        self.version = next_version();
        debug!("store: appended {} curve segments for shape {}", self.curves.len() - start, shape);

        Ok(start..self.curves.len())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn policy(&self) -> DegeneratePolicy {
        self.policy
    }

    pub fn len(&self, kind: PrimitiveKind) -> usize {
        match kind {
            PrimitiveKind::Triangle => self.triangles.len(),
            PrimitiveKind::Curve => self.curves.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty() && self.curves.is_empty()
    }

    /// Kinds with at least one stored primitive
    pub fn kinds(&self) -> Vec<PrimitiveKind> {
        PrimitiveKind::ALL
            .into_iter()
            .filter(|&kind| self.len(kind) > 0)
            .collect()
    }

    /// Per-primitive bounds, `None` for degenerate primitives
    pub fn bounds(&self, kind: PrimitiveKind) -> &[Option<AABB>] {
        match kind {
            PrimitiveKind::Triangle => &self.triangle_bounds,
            PrimitiveKind::Curve => &self.curve_bounds,
        }
    }

    pub fn degenerate_count(&self, kind: PrimitiveKind) -> usize {
        self.bounds(kind).iter().filter(|b| b.is_none()).count()
    }

    pub fn triangles(&self) -> &[TrianglePrimitive] {
        &self.triangles
    }

    pub fn curves(&self) -> &[CurveSegment] {
        &self.curves
    }

    pub fn curve_radii(&self) -> &[f32] {
        &self.curve_radii
    }

    /// Transfers the store to device memory. The returned handle carries the store version
    /// so intersectors can refuse to pair it with an index built from different data.
    pub fn upload(&self, device: &Device) -> Result<UploadedPrimitives> {
        self.upload_kinds(device, &PrimitiveKind::ALL)
    }

    /// Like `upload`, but transfers only the arrays of one kind
    pub fn upload_kind(&self, device: &Device, kind: PrimitiveKind) -> Result<UploadedPrimitives> {
        self.upload_kinds(device, &[kind])
    }

    fn upload_kinds(&self, device: &Device, kinds: &[PrimitiveKind]) -> Result<UploadedPrimitives> {
        let wanted = |kind: PrimitiveKind| kinds.contains(&kind) && self.len(kind) > 0;

        let triangles = if wanted(PrimitiveKind::Triangle) {
            Some(device.create_buffer_from(&self.triangles)?)
        } else {
            None
        };

        let (curves, curve_radii) = if wanted(PrimitiveKind::Curve) {
            (
                Some(device.create_buffer_from(&self.curves)?),
                Some(device.create_buffer_from(&self.curve_radii)?),
            )
        } else {
            (None, None)
        };

        Ok(UploadedPrimitives {
            version: self.version,
            triangles,
            curves,
            curve_radii,
        })
    }
}

/// Device-resident copy of a `PrimitiveStore`
#[derive(Clone)]
pub struct UploadedPrimitives {
    pub version: u64,
    pub triangles: Option<Buffer<TrianglePrimitive>>,
    pub curves: Option<Buffer<CurveSegment>>,
    pub curve_radii: Option<Buffer<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vec3u;

    fn mesh_with_degenerate() -> Mesh {
        Mesh::new(
            vec![
                Vec3(0.0, 0.0, 0.0),
                Vec3(1.0, 0.0, 0.0),
                Vec3(0.0, 1.0, 0.0),
                Vec3(2.0, 0.0, 0.0),
            ],
            // second triangle is collinear
            vec![Vec3u(0, 1, 2), Vec3u(0, 1, 3)],
        )
    }

    #[test]
    fn test_keep_policy_excludes_degenerate_from_bounds() {
        let mut store = PrimitiveStore::new(DegeneratePolicy::Keep);
        let range = store.append_mesh(7, u32::MAX, &mesh_with_degenerate()).unwrap();
        assert_eq!(range, 0..2);
        assert_eq!(store.len(PrimitiveKind::Triangle), 2);
        assert!(store.bounds(PrimitiveKind::Triangle)[0].is_some());
        assert!(store.bounds(PrimitiveKind::Triangle)[1].is_none());
        assert_eq!(store.degenerate_count(PrimitiveKind::Triangle), 1);
        assert_eq!(store.triangles()[1].shape_id, 7);
        assert_eq!(store.triangles()[1].prim_id, 1);
    }

    #[test]
    fn test_reject_policy_fails_and_leaves_store_untouched() {
        let mut store = PrimitiveStore::new(DegeneratePolicy::Reject);
        let version = store.version();
        let err = store.append_mesh(3, u32::MAX, &mesh_with_degenerate()).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidGeometry { shape: 3, primitive: 1, reason: "zero-area triangle" }
        );
        assert!(store.is_empty());
        assert_eq!(store.version(), version);
    }

    #[test]
    fn test_out_of_range_index_is_always_rejected() {
        let mut store = PrimitiveStore::new(DegeneratePolicy::Keep);
        let mesh = Mesh::new(vec![Vec3::zero()], vec![Vec3u(0, 0, 5)]);
        assert!(matches!(
            store.append_mesh(0, u32::MAX, &mesh),
            Err(Error::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn test_curve_bounds_include_radius() {
        let mut store = PrimitiveStore::new(DegeneratePolicy::Keep);
        let mut curves = Curves::default();
        curves.push_strand(&[Vec3(0.0, 0.0, 0.0), Vec3(0.0, 2.0, 0.0)], 0.5);
        store.append_curves(1, u32::MAX, &curves).unwrap();
        let b = store.bounds(PrimitiveKind::Curve)[0].unwrap();
        assert_eq!(b.minimum, Vec3(-0.5, -0.5, -0.5));
        assert_eq!(b.maximum, Vec3(0.5, 2.5, 0.5));
        assert_eq!(store.curve_radii(), &[0.5]);
    }

    #[test]
    fn test_appends_bump_version() {
        let mut store = PrimitiveStore::new(DegeneratePolicy::Keep);
        let v0 = store.version();
        store.append_mesh(0, u32::MAX, &mesh_with_degenerate()).unwrap();
        assert_ne!(store.version(), v0);
        assert_eq!(store.kinds(), vec![PrimitiveKind::Triangle]);
    }
}
