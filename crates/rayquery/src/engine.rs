//! Per-device intersection engine: one device, its settings and one intersector per primitive kind

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    device::{Buffer, Device, Event, Readback},
    error::{Error, Result},
    intersector::{CurveIntersector, Intersector, PreparedScene, RayQuery, TriangleIntersector},
    primitives::PrimitiveKind,
    ray::{Hit, Ray, INVALID_ID},
    settings::EngineSettings,
    world::World,
};

/// Scene uploaded and bound on one device, waiting to replace the active scene
pub struct StagedScene {
    device_id: u64,
    triangles: TriangleIntersector,
    curves: CurveIntersector,
    kinds: Vec<PrimitiveKind>,
    scene: Arc<PreparedScene>,
}

pub struct IntersectionEngine {
    device: Arc<Device>,
    settings: EngineSettings,
    triangles: TriangleIntersector,
    curves: CurveIntersector,
    active: Vec<PrimitiveKind>,
    scene: Option<Arc<PreparedScene>>,
}

impl IntersectionEngine {
    pub fn new(device: Arc<Device>, settings: EngineSettings) -> IntersectionEngine {
        IntersectionEngine {
            triangles: TriangleIntersector::new(device.clone(), settings.query),
            curves: CurveIntersector::new(device.clone(), settings.query),
            device,
            settings,
            active: Vec::new(),
            scene: None,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Build options apply from the next `process`; query options immediately
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        self.settings.set_option(name, value)?;
        self.triangles.set_options(self.settings.query);
        self.curves.set_options(self.settings.query);
        Ok(())
    }

    /// Builds spatial indices for `world` and binds them on the device
    pub fn process(&mut self, world: &World) -> Result<()> {
        let scene = PreparedScene::prepare(world, &self.settings)?;
        self.process_prepared(Arc::new(scene))
    }

    /// Binds an already prepared scene. The previous scene stays active if anything fails.
    pub fn process_prepared(&mut self, scene: Arc<PreparedScene>) -> Result<()> {
        let staged = self.stage(scene)?;
        self.commit(staged);
        Ok(())
    }

    /// Uploads `scene` and binds its indices into fresh intersectors without touching the
    /// active scene. `commit` swaps them in.
    pub fn stage(&self, scene: Arc<PreparedScene>) -> Result<StagedScene> {
        let start = std::time::Instant::now();
        let uploaded = scene.store().upload(&self.device)?;

        let mut triangles = TriangleIntersector::new(self.device.clone(), self.settings.query);
        let mut curves = CurveIntersector::new(self.device.clone(), self.settings.query);
        let kinds = scene.kinds();
        for &kind in &kinds {
            let index = scene.index(kind).ok_or(Error::EmptyScene)?;
            match kind {
                PrimitiveKind::Triangle => triangles.bind(index, &uploaded)?,
                PrimitiveKind::Curve => curves.bind(index, &uploaded)?,
            }
        }
        debug!("{}: staged scene in {:?}", self.device.name(), start.elapsed());

        Ok(StagedScene {
            device_id: self.device.id(),
            triangles,
            curves,
            kinds,
            scene,
        })
    }

    /// Makes a staged scene the active one. Stages built for another device are ignored.
    pub fn commit(&mut self, staged: StagedScene) {
        if staged.device_id != self.device.id() {
            return;
        }
        self.triangles = staged.triangles;
        self.curves = staged.curves;
        self.active = staged.kinds;
        self.scene = Some(staged.scene);
        info!("{}: processed scene ({:?})", self.device.name(), self.active);
    }

    pub fn is_processed(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn scene(&self) -> Option<&Arc<PreparedScene>> {
        self.scene.as_ref()
    }

    fn intersector(&self, kind: PrimitiveKind) -> &dyn Intersector {
        match kind {
            PrimitiveKind::Triangle => &self.triangles,
            PrimitiveKind::Curve => &self.curves,
        }
    }

    // Runs one pass per active kind on the query's queue. Later passes wait on the previous one
    // and merge into its output.
    fn chain<F>(&self, query: &RayQuery, mut pass: F) -> Result<Event>
    where
        F: FnMut(&dyn Intersector, &RayQuery) -> Result<Event>,
    {
        let mut previous: Option<Event> = None;
        for &kind in &self.active {
            let event = match previous.take() {
                None => pass(self.intersector(kind), query)?,
                Some(event) => {
                    let chained = query.clone().after(event).accumulating(true);
                    pass(self.intersector(kind), &chained)?
                }
            };
            previous = Some(event);
        }
        previous.ok_or(Error::NotProcessed)
    }

    /// Closest hit over every primitive kind in the scene
    pub fn intersect(&self, query: &RayQuery, hits: &Buffer<Hit>) -> Result<Event> {
        self.chain(query, |intersector, query| intersector.intersect(query, hits))
    }

    /// Any hit over every primitive kind in the scene
    pub fn occluded(&self, query: &RayQuery, occlusion: &Buffer<u32>) -> Result<Event> {
        self.chain(query, |intersector, query| intersector.occluded(query, occlusion))
    }

    pub fn create_ray_buffer(&self, rays: &[Ray]) -> Result<Buffer<Ray>> {
        self.device.create_buffer_from(rays)
    }

    /// Hit buffer with every record set to a miss
    pub fn create_hit_buffer(&self, len: usize) -> Result<Buffer<Hit>> {
        self.device.create_buffer_from(&vec![Hit::MISS; len])
    }

    /// Occlusion buffer with every record set to `INVALID_ID`
    pub fn create_occlusion_buffer(&self, len: usize) -> Result<Buffer<u32>> {
        self.device.create_buffer_from(&vec![INVALID_ID; len])
    }

    /// Uploads `rays`, enqueues the closest-hit query on `queue` and the readback behind it
    pub fn submit_intersect(&self, queue: u32, rays: &[Ray]) -> Result<Readback<Hit>> {
        if !self.is_processed() {
            return Err(Error::NotProcessed);
        }
        if rays.is_empty() {
            return Ok(Readback::ready(Vec::new()));
        }

        let ray_buffer = self.create_ray_buffer(rays)?;
        let hits = self.create_hit_buffer(rays.len())?;
        let done = self.intersect(&RayQuery::new(queue, ray_buffer, rays.len()), &hits)?;
        debug!("{}: submitted {} rays for intersection", self.device.name(), rays.len());
        self.device.read_buffer(queue, &hits, 0, rays.len(), Some(&done))
    }

    pub fn submit_occluded(&self, queue: u32, rays: &[Ray]) -> Result<Readback<u32>> {
        if !self.is_processed() {
            return Err(Error::NotProcessed);
        }
        if rays.is_empty() {
            return Ok(Readback::ready(Vec::new()));
        }

        let ray_buffer = self.create_ray_buffer(rays)?;
        let occlusion = self.create_occlusion_buffer(rays.len())?;
        let done = self.occluded(&RayQuery::new(queue, ray_buffer, rays.len()), &occlusion)?;
        debug!("{}: submitted {} rays for occlusion", self.device.name(), rays.len());
        self.device.read_buffer(queue, &occlusion, 0, rays.len(), Some(&done))
    }

    /// Blocking closest-hit query over host rays
    pub fn intersect_rays(&self, rays: &[Ray]) -> Result<Vec<Hit>> {
        self.submit_intersect(0, rays)?.wait()
    }

    /// Blocking occlusion query over host rays
    pub fn occluded_rays(&self, rays: &[Ray]) -> Result<Vec<u32>> {
        self.submit_occluded(0, rays)?.wait()
    }
}

impl std::fmt::Debug for IntersectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntersectionEngine")
            .field("device", &self.device.name())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceInfo, DeviceType, HostDeviceSettings},
        geometry::{Vec3, Vec3u},
        primitives::{Curves, Mesh},
    };

    fn engine() -> IntersectionEngine {
        let info = DeviceInfo {
            name: "engine-test".to_owned(),
            vendor: "host".to_owned(),
            device_type: DeviceType::Cpu,
            compute_units: 2,
            has_gl_interop: false,
        };
        let device = Device::host(info, &HostDeviceSettings::default()).unwrap();
        IntersectionEngine::new(Arc::new(device), EngineSettings::default())
    }

    fn wall(z: f32) -> Mesh {
        Mesh::new(
            vec![
                Vec3(-1.0, -1.0, z),
                Vec3(1.0, -1.0, z),
                Vec3(1.0, 1.0, z),
                Vec3(-1.0, 1.0, z),
            ],
            vec![Vec3u(0, 1, 2), Vec3u(0, 2, 3)],
        )
    }

    #[test]
    fn test_queries_before_process() {
        let engine = engine();
        let ray = Ray::new(Vec3(0.0, 0.0, 1.0), Vec3(0.0, 0.0, -1.0));
        assert_eq!(engine.intersect_rays(&[ray]).unwrap_err(), Error::NotProcessed);
        assert_eq!(engine.occluded_rays(&[]).unwrap_err(), Error::NotProcessed);
    }

    #[test]
    fn test_failed_process_keeps_previous_scene() {
        let mut engine = engine();
        let mut world = World::new();
        let id = world.attach_mesh(wall(0.0));
        engine.process(&world).unwrap();

        let mut empty = World::new();
        empty.attach_mesh(Mesh::new(Vec::new(), Vec::new()));
        assert_eq!(engine.process(&empty).unwrap_err(), Error::EmptyScene);

        let hits = engine
            .intersect_rays(&[Ray::new(Vec3(0.0, 0.0, 1.0), Vec3(0.0, 0.0, -1.0))])
            .unwrap();
        assert_eq!(hits[0].shape_id, id);
    }

    #[test]
    fn test_mixed_kinds_return_nearest() {
        let mut engine = engine();
        let mut world = World::new();
        let far_wall = world.attach_mesh(wall(-2.0));
        let mut hair = Curves::default();
        hair.push_strand(&[Vec3(-1.0, 0.0, 0.0), Vec3(1.0, 0.0, 0.0)], 0.1);
        let strand = world.attach_curves(hair);
        engine.process(&world).unwrap();

        let through_strand = Ray::new(Vec3(0.0, 0.0, 1.0), Vec3(0.0, 0.0, -1.0));
        let past_strand = Ray::new(Vec3(0.0, 0.5, 1.0), Vec3(0.0, 0.0, -1.0));
        let hits = engine.intersect_rays(&[through_strand, past_strand]).unwrap();
        assert_eq!(hits[0].shape_id, strand);
        assert!((hits[0].t - 0.9).abs() < 1e-4);
        assert_eq!(hits[1].shape_id, far_wall);
        assert!((hits[1].t - 3.0).abs() < 1e-4);

        let occluded = engine.occluded_rays(&[through_strand, past_strand]).unwrap();
        assert_ne!(occluded[0], INVALID_ID);
        assert_ne!(occluded[1], INVALID_ID);
    }

    #[test]
    fn test_staged_scene_is_inactive_until_committed() {
        let mut engine = engine();
        let mut near = World::new();
        near.attach_mesh(wall(0.0));
        engine.process(&near).unwrap();

        let mut far = World::new();
        far.attach_mesh(wall(-1.0));
        let settings = engine.settings().clone();
        let staged = engine
            .stage(Arc::new(PreparedScene::prepare(&far, &settings).unwrap()))
            .unwrap();

        let ray = Ray::new(Vec3(0.0, 0.0, 1.0), Vec3(0.0, 0.0, -1.0));
        assert!((engine.intersect_rays(&[ray]).unwrap()[0].t - 1.0).abs() < 1e-4);
        engine.commit(staged);
        assert!((engine.intersect_rays(&[ray]).unwrap()[0].t - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_query_options_apply_without_reprocess() {
        let mut engine = engine();
        let mut world = World::new();
        world.attach_mesh(wall(0.0));
        engine.process(&world).unwrap();

        // the wall sits exactly at tmin
        let ray = Ray::with_range(Vec3(0.0, 0.0, 1.0), Vec3(0.0, 0.0, -1.0), 1.0, 10.0);
        assert!(!engine.intersect_rays(&[ray]).unwrap()[0].is_hit());
        engine.set_option("query.inclusive_tmin", "true").unwrap();
        assert!(engine.intersect_rays(&[ray]).unwrap()[0].is_hit());
    }
}
