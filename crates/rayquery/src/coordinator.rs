//! Splits host ray batches across every configured device and merges the results

use std::{ops::Range, sync::Arc};

use tracing::{debug, error, info, warn};

use crate::{
    config::{create_configurations, DeviceConfiguration, DeviceEnumerator, DeviceRole, Mode},
    device::{Device, Readback},
    engine::IntersectionEngine,
    error::{Error, Result},
    intersector::PreparedScene,
    ray::{Hit, Ray},
    settings::EngineSettings,
    world::World,
};

struct Chunk {
    rays: Range<usize>,
    device_id: u64,
}

/// Owns one `IntersectionEngine` per device configuration
pub struct MultiDeviceCoordinator {
    configs: Vec<DeviceConfiguration<IntersectionEngine>>,
    settings: EngineSettings,
    scene: Option<Arc<PreparedScene>>,
}

impl MultiDeviceCoordinator {
    pub fn new<E: DeviceEnumerator + ?Sized>(
        enumerator: &E,
        mode: Mode,
        interop: bool,
        settings: EngineSettings,
    ) -> Result<MultiDeviceCoordinator> {
        let configs = create_configurations(enumerator, mode, interop, |device, _| {
            Ok(IntersectionEngine::new(device.clone(), settings.clone()))
        })?;
        Ok(MultiDeviceCoordinator::from_configurations(configs, settings))
    }

    pub fn from_configurations(
        configs: Vec<DeviceConfiguration<IntersectionEngine>>,
        settings: EngineSettings,
    ) -> MultiDeviceCoordinator {
        MultiDeviceCoordinator {
            configs,
            settings,
            scene: None,
        }
    }

    pub fn configurations(&self) -> &[DeviceConfiguration<IntersectionEngine>] {
        &self.configs
    }

    pub fn primary(&self) -> Option<&DeviceConfiguration<IntersectionEngine>> {
        self.configs.iter().find(|c| c.is_primary())
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Applies a named option to every engine
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        self.settings.set_option(name, value)?;
        for config in &mut self.configs {
            config.renderer.set_option(name, value)?;
        }
        Ok(())
    }

    pub fn is_processed(&self) -> bool {
        self.scene.is_some()
    }

    /// Builds the spatial indices once and binds them on every device
    pub fn process(&mut self, world: &World) -> Result<()> {
        let scene = Arc::new(PreparedScene::prepare(world, &self.settings)?);

        // nothing is committed until every surviving device has staged the scene
        let mut lost = Vec::new();
        let mut staged = Vec::with_capacity(self.configs.len());
        for config in &self.configs {
            match config.renderer.stage(scene.clone()) {
                Ok(stage) => staged.push(stage),
                Err(e) if e.is_fatal() => {
                    config.device.invalidate();
                    lost.push(config.device.id());
                }
                Err(e) => return Err(e),
            }
        }
        for (config, stage) in self
            .configs
            .iter_mut()
            .filter(|c| !lost.contains(&c.device.id()))
            .zip(staged)
        {
            config.renderer.commit(stage);
        }
        self.retire(&lost)?;

        info!("scene bound on {} devices", self.configs.len());
        self.scene = Some(scene);
        Ok(())
    }

    /// Closest hit per ray, in input order
    pub fn intersect(&mut self, rays: &[Ray]) -> Result<Vec<Hit>> {
        self.dispatch(rays, |engine, rays| engine.submit_intersect(0, rays))
    }

    /// Occluding shape id per ray, in input order
    pub fn occluded(&mut self, rays: &[Ray]) -> Result<Vec<u32>> {
        self.dispatch(rays, |engine, rays| engine.submit_occluded(0, rays))
    }

    fn engine(&self, device_id: u64) -> Option<&IntersectionEngine> {
        self.configs
            .iter()
            .find(|c| c.device.id() == device_id)
            .map(|c| &c.renderer)
    }

    // Contiguous slices proportional to each device's compute units
    fn split(&self, range: Range<usize>) -> Vec<Chunk> {
        let devices: Vec<&Arc<Device>> = self.configs.iter().map(|c| &c.device).collect();
        split_weighted(range, &devices)
    }

    fn dispatch<T, F>(&mut self, rays: &[Ray], submit: F) -> Result<Vec<T>>
    where
        F: Fn(&IntersectionEngine, &[Ray]) -> Result<Readback<T>>,
    {
        if self.scene.is_none() {
            return Err(Error::NotProcessed);
        }
        if rays.is_empty() {
            return Ok(Vec::new());
        }

        let mut pending = self.split(0..rays.len());
        let mut done: Vec<(usize, Vec<T>)> = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            // submit everything before waiting on anything
            let mut submitted = Vec::with_capacity(pending.len());
            for chunk in pending.drain(..) {
                let engine = self.engine(chunk.device_id).ok_or(Error::NoComputeDevices)?;
                let readback = submit(engine, &rays[chunk.rays.clone()]);
                debug!("chunk {:?} submitted to {}", chunk.rays, engine.device().name());
                submitted.push((chunk, readback));
            }

            let mut failed = Vec::new();
            let mut lost = Vec::new();
            for (chunk, readback) in submitted {
                match readback.and_then(Readback::wait) {
                    Ok(data) => done.push((chunk.rays.start, data)),
                    Err(e) if e.is_fatal() => {
                        error!("chunk {:?} failed: {}", chunk.rays, e);
                        if !lost.contains(&chunk.device_id) {
                            lost.push(chunk.device_id);
                        }
                        failed.push(chunk.rays);
                    }
                    Err(e) => return Err(e),
                }
            }

            for &id in &lost {
                if let Some(config) = self.configs.iter().find(|c| c.device.id() == id) {
                    config.device.invalidate();
                }
            }
            self.retire(&lost)?;

            for rays in failed {
                pending.extend(self.split(rays));
            }
        }

        done.sort_by_key(|(start, _)| *start);
        Ok(done.into_iter().flat_map(|(_, data)| data).collect())
    }

    // Drops configurations whose device is lost, keeping exactly one primary
    fn retire(&mut self, lost: &[u64]) -> Result<()> {
        if lost.is_empty() {
            return Ok(());
        }

        let mut device = String::new();
        self.configs.retain(|c| {
            let keep = !lost.contains(&c.device.id());
            if !keep {
                error!("retiring device {}", c.device.name());
                device = c.device.name().to_owned();
            }
            keep
        });

        if self.configs.is_empty() {
            return Err(Error::device_unavailable(&device, "no surviving devices"));
        }
        if self.primary().is_none() {
            let promoted = &mut self.configs[0];
            promoted.role = DeviceRole::Primary;
            warn!("promoting {} to primary", promoted.device.name());
        }
        Ok(())
    }
}

fn split_weighted(range: Range<usize>, devices: &[&Arc<Device>]) -> Vec<Chunk> {
    let weights: Vec<u64> = devices
        .iter()
        .map(|d| d.info().compute_units.max(1) as u64)
        .collect();
    let total: u64 = weights.iter().sum();
    let len = range.len() as u64;

    let mut chunks = Vec::with_capacity(devices.len());
    let mut accumulated = 0;
    let mut start = range.start;
    for (device, weight) in devices.iter().zip(weights) {
        accumulated += weight;
        let end = range.start + (len * accumulated / total) as usize;
        if end > start {
            chunks.push(Chunk {
                rays: start..end,
                device_id: device.id(),
            });
        }
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{HostEnumerator, PlatformInfo},
        device::{DeviceInfo, DeviceType, HostDeviceSettings},
        ray::INVALID_ID,
        scene::test_scenes,
    };

    fn gpu(name: &str, compute_units: u32) -> DeviceInfo {
        DeviceInfo {
            name: name.to_owned(),
            vendor: "test".to_owned(),
            device_type: DeviceType::Gpu,
            compute_units,
            has_gl_interop: false,
        }
    }

    fn coordinator(devices: Vec<DeviceInfo>) -> MultiDeviceCoordinator {
        let enumerator = HostEnumerator::with_platforms(vec![PlatformInfo {
            name: "test".to_owned(),
            devices,
        }])
        .with_settings(HostDeviceSettings {
            queue_count: 1,
            threads: Some(2),
        });
        MultiDeviceCoordinator::new(&enumerator, Mode::AllGpus, false, EngineSettings::default()).unwrap()
    }

    #[test]
    fn test_split_is_weighted_and_contiguous() {
        let coordinator = coordinator(vec![gpu("a", 1), gpu("b", 3)]);
        let chunks = coordinator.split(0..100);
        let ranges: Vec<_> = chunks.iter().map(|c| c.rays.clone()).collect();
        assert_eq!(ranges, vec![0..25, 25..100]);

        // fewer rays than devices leaves some devices idle
        let chunks = coordinator.split(10..11);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].rays, 10..11);
    }

    #[test]
    fn test_query_before_process() {
        let mut coordinator = coordinator(vec![gpu("a", 1)]);
        assert_eq!(coordinator.intersect(&[]).unwrap_err(), Error::NotProcessed);
    }

    #[test]
    fn test_lost_device_chunks_are_rerouted() {
        let mut coordinator = coordinator(vec![gpu("a", 2), gpu("b", 2), gpu("c", 2)]);
        let world = test_scenes::triangle_grid(8);
        coordinator.process(&world).unwrap();
        let rays = test_scenes::random_rays(300, 7);
        let expected = coordinator.intersect(&rays).unwrap();

        let primary = coordinator.primary().unwrap().device.clone();
        primary.invalidate();
        let hits = coordinator.intersect(&rays).unwrap();
        assert_eq!(hits, expected);
        assert_eq!(coordinator.configurations().len(), 2);
        assert_eq!(coordinator.configurations().iter().filter(|c| c.is_primary()).count(), 1);

        let occluded = coordinator.occluded(&rays).unwrap();
        for (hit, record) in hits.iter().zip(occluded) {
            assert_eq!(hit.is_hit(), record != INVALID_ID);
        }
    }

    #[test]
    fn test_reprocess_moves_every_device_together() {
        let mut coordinator = coordinator(vec![gpu("a", 1), gpu("b", 1), gpu("c", 1)]);
        let rays = test_scenes::random_rays(200, 5);
        coordinator.process(&test_scenes::triangle_grid(8)).unwrap();
        let grid_hits = coordinator.intersect(&rays).unwrap();

        assert_eq!(coordinator.process(&World::new()).unwrap_err(), Error::EmptyScene);
        assert_eq!(coordinator.intersect(&rays).unwrap(), grid_hits);

        let random = test_scenes::random_triangles(300, 6);
        coordinator.configurations()[1].device.invalidate();
        coordinator.process(&random).unwrap();
        assert_eq!(coordinator.configurations().len(), 2);
        for config in coordinator.configurations() {
            assert!(Arc::ptr_eq(config.renderer.scene().unwrap(), coordinator.scene.as_ref().unwrap()));
        }

        let device = Arc::new(Device::host(gpu("reference", 1), &HostDeviceSettings::default()).unwrap());
        let mut reference = IntersectionEngine::new(device, EngineSettings::default());
        reference.process(&random).unwrap();
        assert_eq!(coordinator.intersect(&rays).unwrap(), reference.intersect_rays(&rays).unwrap());
    }

    #[test]
    fn test_all_devices_lost() {
        let mut coordinator = coordinator(vec![gpu("a", 1), gpu("b", 1)]);
        coordinator.process(&test_scenes::single_triangle()).unwrap();
        for config in coordinator.configurations() {
            config.device.invalidate();
        }
        let rays = test_scenes::random_rays(10, 1);
        assert!(matches!(
            coordinator.intersect(&rays),
            Err(Error::DeviceUnavailable { .. })
        ));
    }
}
