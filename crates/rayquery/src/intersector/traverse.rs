//! Stackless traversal of the skip-link BVH, executed by host devices

use rayon::{prelude::*, ThreadPool};

use super::{curves::CurveLeaves, triangles::TriangleLeaves, RayCount};
use crate::{
    accel::{LinearizedBVHNode, INVALID_INDEX},
    device::{Buffer, Device},
    error::Result,
    geometry::Vec3,
    primitives::{CurveSegment, TrianglePrimitive},
    ray::{Hit, Ray, INVALID_ID},
};

#[derive(Clone)]
pub(crate) enum LeafBuffers {
    Triangles {
        primitives: Buffer<TrianglePrimitive>,
    },
    Curves {
        segments: Buffer<CurveSegment>,
        radii: Buffer<f32>,
    },
}

#[derive(Clone)]
pub(crate) enum QueryOutput {
    Closest(Buffer<Hit>),
    Any(Buffer<u32>),
}

/// Everything one traversal dispatch reads and writes
#[derive(Clone)]
pub(crate) struct TraversalLaunch {
    pub(crate) nodes: Buffer<LinearizedBVHNode>,
    pub(crate) primitive_indices: Buffer<u32>,
    pub(crate) leaves: LeafBuffers,
    pub(crate) rays: Buffer<Ray>,
    pub(crate) count: RayCount,
    pub(crate) max_rays: usize,
    pub(crate) output: QueryOutput,
    pub(crate) accumulate: bool,
    pub(crate) inclusive_tmin: bool,
}

impl TraversalLaunch {
    pub(crate) fn check_device(&self, device: &Device) -> Result<()> {
        device.check_buffer(&self.nodes)?;
        device.check_buffer(&self.primitive_indices)?;
        device.check_buffer(&self.rays)?;
        match &self.leaves {
            LeafBuffers::Triangles { primitives } => device.check_buffer(primitives)?,
            LeafBuffers::Curves { segments, radii } => {
                device.check_buffer(segments)?;
                device.check_buffer(radii)?;
            }
        }
        match &self.output {
            QueryOutput::Closest(hits) => device.check_buffer(hits)?,
            QueryOutput::Any(records) => device.check_buffer(records)?,
        }
        if let RayCount::Device(counter) = &self.count {
            device.check_buffer(counter)?;
        }
        Ok(())
    }
}

/// Parametric window a candidate hit must fall into
#[derive(Debug, Clone, Copy)]
pub(crate) struct HitRange {
    pub(crate) tmin: f32,
    pub(crate) tmax: f32,
    pub(crate) inclusive_tmin: bool,
    /// Set once a hit is recorded so later candidates must be strictly closer
    pub(crate) exclusive_tmax: bool,
}

impl HitRange {
    fn new(ray: &Ray, inclusive_tmin: bool) -> HitRange {
        HitRange {
            tmin: ray.tmin,
            tmax: ray.tmax,
            inclusive_tmin,
            exclusive_tmax: false,
        }
    }

    pub(crate) fn accepts(&self, t: f32) -> bool {
        let above = if self.inclusive_tmin { t >= self.tmin } else { t > self.tmin };
        let below = if self.exclusive_tmax { t < self.tmax } else { t <= self.tmax };
        above && below
    }

    fn shrink(&mut self, t: f32) {
        self.tmax = t;
        self.exclusive_tmax = true;
    }
}

/// Primitive test for one kind of leaf
pub(crate) trait LeafTest: Sync {
    /// `prim` is an index into the store's array for this kind
    fn intersect(&self, prim: u32, ray: &Ray, range: &HitRange) -> Option<Hit>;
}

fn inverse_direction(direction: Vec3) -> Vec3 {
    Vec3(1.0 / direction.0, 1.0 / direction.1, 1.0 / direction.2)
}

pub(crate) struct Traversal<'a, L: LeafTest> {
    pub(crate) nodes: &'a [LinearizedBVHNode],
    pub(crate) primitive_indices: &'a [u32],
    pub(crate) leaves: &'a L,
}

impl<'a, L: LeafTest> Traversal<'a, L> {
    // Walks nodes in order; a missed box or a finished leaf jumps to `skip`
    fn walk(&self, ray: &Ray, mut range: HitRange, any_hit: bool) -> Option<Hit> {
        let origin = ray.origin();
        let inv_direction = inverse_direction(ray.direction());
        let mut closest = None;

        let mut node_idx = 0;
        while node_idx != INVALID_INDEX {
            let Some(node) = self.nodes.get(node_idx as usize) else {
                break;
            };

            let box_hit = node
                .bounds()
                .intersect_ray(origin, inv_direction, range.tmin..range.tmax)
                .is_some();

            if !box_hit {
                node_idx = node.skip;
                continue;
            }

            if !node.is_leaf() {
                node_idx += 1;
                continue;
            }

            let start = node.prim_start as usize;
            let end = start + node.prim_count as usize;
            for &prim in self.primitive_indices.get(start..end).unwrap_or_default() {
                if let Some(hit) = self.leaves.intersect(prim, ray, &range) {
                    if any_hit {
                        return Some(hit);
                    }
                    range.shrink(hit.t);
                    closest = Some(hit);
                }
            }
            node_idx = node.skip;
        }

        closest
    }

    /// Nearest hit of `ray`; with `existing` only hits closer than it are reported
    pub(crate) fn closest_hit(&self, ray: &Ray, existing: Option<&Hit>, inclusive_tmin: bool) -> Option<Hit> {
        if !ray.is_traceable() {
            return None;
        }
        let mut range = HitRange::new(ray, inclusive_tmin);
        if let Some(existing) = existing.filter(|h| h.is_hit()) {
            if existing.t <= range.tmax {
                range.shrink(existing.t);
            }
        }
        self.walk(ray, range, false)
    }

    pub(crate) fn any_hit(&self, ray: &Ray, inclusive_tmin: bool) -> Option<Hit> {
        if !ray.is_traceable() {
            return None;
        }
        self.walk(ray, HitRange::new(ray, inclusive_tmin), true)
    }
}

/// Runs `launch` over the device's pool
pub(crate) fn execute(launch: &TraversalLaunch, pool: &ThreadPool) -> Result<()> {
    let nodes = launch.nodes.host_data()?.read();
    let primitive_indices = launch.primitive_indices.host_data()?.read();

    match &launch.leaves {
        LeafBuffers::Triangles { primitives } => {
            let primitives = primitives.host_data()?.read();
            let leaves = TriangleLeaves {
                primitives: &primitives,
            };
            let traversal = Traversal {
                nodes: &nodes,
                primitive_indices: &primitive_indices,
                leaves: &leaves,
            };
            dispatch(launch, &traversal, pool)
        }
        LeafBuffers::Curves { segments, radii } => {
            let segments = segments.host_data()?.read();
            let radii = radii.host_data()?.read();
            let leaves = CurveLeaves {
                segments: &segments,
                radii: &radii,
            };
            let traversal = Traversal {
                nodes: &nodes,
                primitive_indices: &primitive_indices,
                leaves: &leaves,
            };
            dispatch(launch, &traversal, pool)
        }
    }
}

fn dispatch<L: LeafTest>(launch: &TraversalLaunch, traversal: &Traversal<'_, L>, pool: &ThreadPool) -> Result<()> {
    let rays = launch.rays.host_data()?.read();
    let count = match &launch.count {
        RayCount::Immediate(count) => *count,
        RayCount::Device(counter) => counter.host_data()?.read().first().copied().unwrap_or(0) as usize,
    };
    let count = count.min(launch.max_rays).min(rays.len());
    let rays = &rays[..count];
    let accumulate = launch.accumulate;
    let inclusive_tmin = launch.inclusive_tmin;

    match &launch.output {
        QueryOutput::Closest(hits) => {
            let mut hits = hits.host_data()?.write();
            let count = count.min(hits.len());
            let hits = &mut hits[..count];
            pool.install(|| {
                hits.par_iter_mut()
                    .zip(rays.par_iter())
                    .for_each(|(record, ray)| {
                        let existing = accumulate.then_some(&*record);
                        match traversal.closest_hit(ray, existing, inclusive_tmin) {
                            Some(hit) => *record = hit,
                            None if !accumulate => *record = Hit::MISS,
                            None => {}
                        }
                    });
            });
        }
        QueryOutput::Any(records) => {
            let mut records = records.host_data()?.write();
            let count = count.min(records.len());
            let records = &mut records[..count];
            pool.install(|| {
                records
                    .par_iter_mut()
                    .zip(rays.par_iter())
                    .for_each(|(record, ray)| {
                        if accumulate && *record != INVALID_ID {
                            return;
                        }
                        *record = traversal
                            .any_hit(ray, inclusive_tmin)
                            .map_or(INVALID_ID, |hit| hit.shape_id);
                    });
            });
        }
    }

    Ok(())
}
