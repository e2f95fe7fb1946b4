//! Intersection queries over a processed scene.
//!
//! Each primitive kind has its own [`Intersector`] variant holding that kind's device-resident
//! index and primitive buffers. Queries are asynchronous: they validate the batch, enqueue a
//! traversal on the requested queue behind the caller's wait event, and return the event that
//! signals completion.

pub mod curves;
pub(crate) mod traverse;
pub mod triangles;

use tracing::info;

pub use curves::CurveIntersector;
pub use triangles::TriangleIntersector;

use crate::{
    accel::{LinearizedBVHNode, SpatialIndex, SpatialIndexBuilder},
    device::{Buffer, Device, Event},
    error::{Error, Result},
    primitives::{PrimitiveKind, PrimitiveStore, UploadedPrimitives},
    ray::{Hit, Ray},
    settings::{EngineSettings, QueryOptions},
    world::World,
};
use traverse::{LeafBuffers, QueryOutput, TraversalLaunch};

/// Number of active rays in a batch
#[derive(Clone, Debug)]
pub enum RayCount {
    Immediate(usize),
    /// Single `u32` read on the device when the traversal runs, clamped to `max_rays`
    Device(Buffer<u32>),
}

/// One batch of rays to trace
#[derive(Clone, Debug)]
pub struct RayQuery {
    pub queue: u32,
    pub rays: Buffer<Ray>,
    pub count: RayCount,
    /// Upper bound on the active count; output buffers must hold at least this many records
    pub max_rays: usize,
    pub wait: Option<Event>,
    /// Merge with the existing output instead of overwriting it
    pub accumulate: bool,
}

impl RayQuery {
    pub fn new(queue: u32, rays: Buffer<Ray>, count: usize) -> RayQuery {
        RayQuery {
            queue,
            rays,
            count: RayCount::Immediate(count),
            max_rays: count,
            wait: None,
            accumulate: false,
        }
    }

    pub fn with_device_count(queue: u32, rays: Buffer<Ray>, counter: Buffer<u32>, max_rays: usize) -> RayQuery {
        RayQuery {
            queue,
            rays,
            count: RayCount::Device(counter),
            max_rays,
            wait: None,
            accumulate: false,
        }
    }

    pub fn after(mut self, event: Event) -> RayQuery {
        self.wait = Some(event);
        self
    }

    pub fn accumulating(mut self, accumulate: bool) -> RayQuery {
        self.accumulate = accumulate;
        self
    }

    pub(crate) fn validate(&self, output_len: usize) -> Result<()> {
        let capacity = self.rays.len();
        if self.max_rays > capacity {
            return Err(Error::InvalidBatch {
                requested: self.max_rays,
                capacity,
            });
        }
        if self.max_rays > output_len {
            return Err(Error::InvalidBatch {
                requested: self.max_rays,
                capacity: output_len,
            });
        }
        if let RayCount::Immediate(count) = self.count {
            if count > capacity {
                return Err(Error::InvalidBatch {
                    requested: count,
                    capacity,
                });
            }
        }
        Ok(())
    }
}

/// Capability shared by the per-kind intersector variants
pub trait Intersector: Send + Sync {
    fn kind(&self) -> PrimitiveKind;

    /// Uploads and binds this kind's index and primitives. On error the previous binding
    /// stays in place.
    fn process(&mut self, scene: &PreparedScene) -> Result<()>;

    fn is_processed(&self) -> bool;

    /// Closest hit per ray. Misses are written as `Hit::MISS` unless the query accumulates.
    fn intersect(&self, query: &RayQuery, hits: &Buffer<Hit>) -> Result<Event>;

    /// Occluding shape id per ray, or `INVALID_ID`
    fn occluded(&self, query: &RayQuery, occlusion: &Buffer<u32>) -> Result<Event>;
}

/// Host-side result of processing a world: the primitive store and one index per kind present
#[derive(Debug)]
pub struct PreparedScene {
    store: PrimitiveStore,
    triangles: Option<SpatialIndex>,
    curves: Option<SpatialIndex>,
    world_version: u64,
}

impl PreparedScene {
    pub fn prepare(world: &World, settings: &EngineSettings) -> Result<PreparedScene> {
        let store = PrimitiveStore::from_world(world, settings.degenerate_policy)?;
        let builder = SpatialIndexBuilder::new(settings.build.clone());
        let mut scene = PreparedScene::from_store(store, &builder)?;
        scene.world_version = world.version();
        Ok(scene)
    }

    pub fn from_store(store: PrimitiveStore, builder: &SpatialIndexBuilder) -> Result<PreparedScene> {
        if store.is_empty() {
            return Err(Error::EmptyScene);
        }

        let build_kind = |kind| -> Result<Option<SpatialIndex>> {
            if store.len(kind) == 0 {
                return Ok(None);
            }
            builder.build(kind, store.bounds(kind), store.version()).map(Some)
        };
        let triangles = build_kind(PrimitiveKind::Triangle)?;
        let curves = build_kind(PrimitiveKind::Curve)?;

        info!(
            "prepared scene: {} triangles, {} curve segments",
            store.len(PrimitiveKind::Triangle),
            store.len(PrimitiveKind::Curve)
        );

        Ok(PreparedScene {
            store,
            triangles,
            curves,
            world_version: 0,
        })
    }

    pub fn store(&self) -> &PrimitiveStore {
        &self.store
    }

    pub fn index(&self, kind: PrimitiveKind) -> Option<&SpatialIndex> {
        match kind {
            PrimitiveKind::Triangle => self.triangles.as_ref(),
            PrimitiveKind::Curve => self.curves.as_ref(),
        }
    }

    pub fn kinds(&self) -> Vec<PrimitiveKind> {
        self.store.kinds()
    }

    pub fn world_version(&self) -> u64 {
        self.world_version
    }
}

/// Device copy of one spatial index
pub(crate) struct IndexBinding {
    nodes: Buffer<LinearizedBVHNode>,
    primitive_indices: Buffer<u32>,
}

impl IndexBinding {
    pub(crate) fn upload(
        device: &Device,
        kind: PrimitiveKind,
        index: &SpatialIndex,
        primitives: &UploadedPrimitives,
    ) -> Result<IndexBinding> {
        // an index of another kind was not built from these primitives either
        if index.kind() != kind || index.source_version() != primitives.version {
            return Err(Error::StaleIndex {
                index_version: index.source_version(),
                store_version: primitives.version,
            });
        }

        Ok(IndexBinding {
            nodes: device.create_buffer_from(index.nodes())?,
            primitive_indices: device.create_buffer_from(index.primitive_indices())?,
        })
    }

    pub(crate) fn launch(
        &self,
        query: &RayQuery,
        leaves: LeafBuffers,
        output: QueryOutput,
        output_len: usize,
        options: &QueryOptions,
    ) -> Result<TraversalLaunch> {
        query.validate(output_len)?;
        Ok(TraversalLaunch {
            nodes: self.nodes.clone(),
            primitive_indices: self.primitive_indices.clone(),
            leaves,
            rays: query.rays.clone(),
            count: query.count.clone(),
            max_rays: query.max_rays,
            output,
            accumulate: query.accumulate,
            inclusive_tmin: options.inclusive_tmin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceInfo, DeviceType, HostDeviceSettings},
        geometry::{Vec3, Vec3u},
        primitives::{DegeneratePolicy, Mesh},
        ray::INVALID_ID,
    };
    use std::sync::Arc;

    fn device() -> Arc<Device> {
        let info = DeviceInfo {
            name: "intersector-test".to_owned(),
            vendor: "host".to_owned(),
            device_type: DeviceType::Cpu,
            compute_units: 2,
            has_gl_interop: false,
        };
        Arc::new(Device::host(info, &HostDeviceSettings::default()).unwrap())
    }

    fn quad_store() -> PrimitiveStore {
        let mesh = Mesh::new(
            vec![
                Vec3(-1.0, -1.0, 0.0),
                Vec3(1.0, -1.0, 0.0),
                Vec3(1.0, 1.0, 0.0),
                Vec3(-1.0, 1.0, 0.0),
            ],
            vec![Vec3u(0, 1, 2), Vec3u(0, 2, 3)],
        );
        let mut store = PrimitiveStore::new(DegeneratePolicy::Keep);
        store.append_mesh(5, u32::MAX, &mesh).unwrap();
        store
    }

    #[test]
    fn test_query_before_process_fails() {
        let device = device();
        let intersector = TriangleIntersector::new(device.clone(), QueryOptions::default());
        let rays = device.create_buffer::<Ray>(1).unwrap();
        let hits = device.create_buffer::<Hit>(1).unwrap();
        assert_eq!(
            intersector.intersect(&RayQuery::new(0, rays, 1), &hits).unwrap_err(),
            Error::NotProcessed
        );
    }

    #[test]
    fn test_batch_validation() {
        let device = device();
        let scene = PreparedScene::from_store(quad_store(), &SpatialIndexBuilder::default()).unwrap();
        let mut intersector = TriangleIntersector::new(device.clone(), QueryOptions::default());
        intersector.process(&scene).unwrap();

        let rays = device.create_buffer::<Ray>(4).unwrap();
        let hits = device.create_buffer::<Hit>(2).unwrap();
        assert_eq!(
            intersector.intersect(&RayQuery::new(0, rays.clone(), 5), &hits).unwrap_err(),
            Error::InvalidBatch { requested: 5, capacity: 4 }
        );
        assert_eq!(
            intersector.intersect(&RayQuery::new(0, rays, 3), &hits).unwrap_err(),
            Error::InvalidBatch { requested: 3, capacity: 2 }
        );
    }

    #[test]
    fn test_stale_index_is_rejected_and_binding_kept() {
        let device = device();
        let builder = SpatialIndexBuilder::default();
        let store = quad_store();
        let other = quad_store();

        let mut intersector = TriangleIntersector::new(device.clone(), QueryOptions::default());
        let index = builder.build_triangles(&store).unwrap();
        intersector.bind(&index, &store.upload(&device).unwrap()).unwrap();

        let stale = builder.build_triangles(&other).unwrap();
        let err = intersector.bind(&stale, &store.upload(&device).unwrap()).unwrap_err();
        assert!(matches!(err, Error::StaleIndex { .. }));
        assert!(intersector.is_processed());
    }

    #[test]
    fn test_device_count_is_clamped_and_tail_untouched() {
        let device = device();
        let scene = PreparedScene::from_store(quad_store(), &SpatialIndexBuilder::default()).unwrap();
        let mut intersector = TriangleIntersector::new(device.clone(), QueryOptions::default());
        intersector.process(&scene).unwrap();

        let ray = Ray::new(Vec3(0.0, 0.0, 1.0), Vec3(0.0, 0.0, -1.0));
        let rays = device.create_buffer_from(&[ray; 4]).unwrap();
        let counter = device.create_buffer_from(&[100u32]).unwrap();
        let occlusion = device.create_buffer_from(&[7u32; 4]).unwrap();

        let query = RayQuery::with_device_count(0, rays, counter, 3);
        intersector.occluded(&query, &occlusion).unwrap().wait().unwrap();
        let records = device.read_buffer(0, &occlusion, 0, 4, None).unwrap().wait().unwrap();
        assert_eq!(records, vec![5, 5, 5, 7]);
        assert_ne!(records[0], INVALID_ID);
    }
}
