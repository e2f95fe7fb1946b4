//! OpenCL backend. Transfers and kernel launches are enqueued without blocking and ordered
//! through OpenCL events. Dependencies from another context are bridged through user events.

use std::{
    any::Any,
    fmt,
    mem::size_of,
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use cl3::{
    event::{create_user_event, set_user_event_status},
    ext::{
        CL_COMPLETE, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_GPU, CL_FALSE,
        CL_MEM_READ_WRITE, CL_TRUE,
    },
    types::{cl_context_properties, cl_event, cl_int, cl_mem, cl_uint},
};
use opencl3::{
    command_queue::CommandQueue,
    context::Context,
    device::Device as ClDevice,
    event::Event as RawEvent,
    kernel::{ExecuteKernel, Kernel},
    memory::{Buffer as ClMemBuffer, ClMem},
    platform::get_platforms,
    program::Program,
};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{ContextKind, Device, DeviceInfo, DeviceRecord, DeviceType, Event};
use crate::{
    config::{DeviceEnumerator, PlatformInfo},
    error::{Error, Result},
    intersector::{
        traverse::{LeafBuffers, QueryOutput, TraversalLaunch},
        RayCount,
    },
};

const TRAVERSE_SOURCE: &str = include_str!("kernels/traverse.cl");

// Any negative status terminates the commands waiting on a user event
const DEPENDENCY_FAILED: cl_int = -1;

/// Set by a bridge thread when the foreign event it forwards fails
type DependencyFailure = Arc<Mutex<Option<Error>>>;

/// Host memory an enqueued command reads or writes. Dropping it waits for the command first.
struct InFlight {
    event: Arc<RawEvent>,
    _payload: Box<dyn Any + Send + Sync>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let _ = self.event.wait();
    }
}

/// Completion of an OpenCL command
#[derive(Clone)]
pub(crate) struct ClEvent {
    event: Arc<RawEvent>,
    context: usize,
    device: Arc<str>,
    lost: Arc<AtomicBool>,
    failures: Vec<DependencyFailure>,
    _in_flight: Option<Arc<InFlight>>,
}

impl ClEvent {
    pub(crate) fn wait(&self) -> Result<()> {
        self.event.wait().or_else(|e| {
            // terminated by a failed dependency; the device itself is fine
            if let Some(error) = self.dependency_failure() {
                return Err(error);
            }
            self.lost.store(true, Ordering::Release);
            error!("device {} lost: {}", self.device, e);
            Err(Error::device_unavailable(&self.device, e))
        })
    }

    pub(crate) fn is_complete(&self) -> bool {
        // CL_COMPLETE is 0, errors are negative
        self.event
            .command_execution_status()
            .map(|status| status.0 <= 0)
            .unwrap_or(true)
    }

    fn dependency_failure(&self) -> Option<Error> {
        self.failures.iter().find_map(|failure| failure.lock().clone())
    }
}

/// Wait list for one enqueue, plus the failure slots of every bridged dependency behind it
#[derive(Default)]
struct Dependencies {
    events: Vec<Arc<RawEvent>>,
    failures: Vec<DependencyFailure>,
}

impl Dependencies {
    fn raw(&self) -> Vec<cl_event> {
        self.events.iter().map(|event| event.get()).collect()
    }
}

enum WaitList {
    Ready(Dependencies),
    Failed(Error),
}

pub(crate) struct ClBackend {
    name: Arc<str>,
    context: Context,
    queues: Vec<CommandQueue>,
    _program: Program,
    closest: Mutex<Kernel>,
    any: Mutex<Kernel>,
    // bound to kernel arguments a launch does not read
    placeholder: ClMemBuffer<u32>,
    lost: Arc<AtomicBool>,
}

fn cl_error(name: &str, what: &str) -> impl Fn(opencl3::error_codes::ClError) -> Error + '_ {
    let what = what.to_owned();
    move |e| Error::device_unavailable(name, format!("{}: {}", what, e))
}

impl ClBackend {
    fn open(
        name: &str,
        device: &ClDevice,
        properties: Option<&[cl_context_properties]>,
        queue_count: u32,
        lost: Arc<AtomicBool>,
    ) -> Result<ClBackend> {
        let context = match properties {
            Some(properties) => Context::from_devices(&[device.id()], properties, None, null_mut())
                .map_err(cl_error(name, "unable to create shared context"))?,
            None => Context::from_device(device).map_err(cl_error(name, "unable to create context"))?,
        };

        let program = Program::create_and_build_from_sources(&context, &[TRAVERSE_SOURCE], "")
            .map_err(|log| Error::device_unavailable(name, format!("unable to build traversal program: {}", log)))?;
        let closest = Kernel::create(&program, "traverse_closest").map_err(cl_error(name, "unable to get kernel"))?;
        let any = Kernel::create(&program, "traverse_any").map_err(cl_error(name, "unable to get kernel"))?;

        let mut queues = Vec::with_capacity(queue_count as usize);
        for _ in 0..queue_count {
            let queue = CommandQueue::create_default_with_properties(&context, 0, 0)
                .map_err(cl_error(name, "unable to create command queue"))?;
            queues.push(queue);
        }

        let placeholder = unsafe {
            ClMemBuffer::<u32>::create(&context, CL_MEM_READ_WRITE, 1, null_mut())
                .map_err(cl_error(name, "unable to create buffer"))?
        };

        Ok(ClBackend {
            name: Arc::from(name),
            context,
            queues,
            _program: program,
            closest: Mutex::new(closest),
            any: Mutex::new(any),
            placeholder,
            lost,
        })
    }

    pub(crate) fn queue_count(&self) -> u32 {
        self.queues.len() as u32
    }

    fn fail(&self, what: &str) -> impl Fn(opencl3::error_codes::ClError) -> Error + '_ {
        let what = what.to_owned();
        move |e| {
            self.lost.store(true, Ordering::Release);
            error!("device {} lost: {}: {}", self.name, what, e);
            Error::device_unavailable(&self.name, format!("{}: {}", what, e))
        }
    }

    fn event(&self, event: RawEvent, dependencies: &Dependencies, payload: Option<Box<dyn Any + Send + Sync>>) -> Event {
        let event = Arc::new(event);
        let in_flight = payload.map(|payload| {
            Arc::new(InFlight {
                event: event.clone(),
                _payload: payload,
            })
        });
        Event::from_opencl(ClEvent {
            event,
            context: self.context.get() as usize,
            device: self.name.clone(),
            lost: self.lost.clone(),
            failures: dependencies.failures.clone(),
            _in_flight: in_flight,
        })
    }

    // Events of this context go straight into the wait list; anything else is forwarded
    fn resolve_wait(&self, wait: Option<&Event>) -> Result<WaitList> {
        let Some(wait) = wait else {
            return Ok(WaitList::Ready(Dependencies::default()));
        };
        match wait.as_opencl() {
            Some(cl) if cl.context == self.context.get() as usize => Ok(WaitList::Ready(Dependencies {
                events: vec![cl.event.clone()],
                failures: cl.failures.clone(),
            })),
            _ if wait.is_complete() => Ok(match wait.wait() {
                Ok(()) => WaitList::Ready(Dependencies::default()),
                Err(e) => WaitList::Failed(e),
            }),
            _ => self.bridge(wait).map(WaitList::Ready),
        }
    }

    /// User event of this context signalled from a helper thread once `dependency` finishes
    fn bridge(&self, dependency: &Event) -> Result<Dependencies> {
        let raw = create_user_event(self.context.get())
            .map_err(|e| Error::device_unavailable(&self.name, format!("unable to create user event: {}", e)))?;
        let user = Arc::new(RawEvent::new(raw));
        let failure = DependencyFailure::default();

        let signal = user.clone();
        let slot = failure.clone();
        let dependency = dependency.clone();
        let name = self.name.clone();
        thread::Builder::new()
            .name(format!("{}-bridge", self.name))
            .spawn(move || {
                let status = match dependency.wait() {
                    Ok(()) => CL_COMPLETE,
                    Err(e) => {
                        trace!("{}: bridged dependency failed: {}", name, e);
                        *slot.lock() = Some(e);
                        DEPENDENCY_FAILED
                    }
                };
                if let Err(e) = set_user_event_status(signal.get(), status) {
                    warn!("{}: unable to signal bridged dependency: {}", name, e);
                }
            })
            .map_err(|e| Error::device_unavailable(&self.name, e))?;

        Ok(Dependencies {
            events: vec![user],
            failures: vec![failure],
        })
    }

    pub(crate) fn create_buffer<T: DeviceRecord>(&self, len: usize) -> Result<ClMemBuffer<T>> {
        self.create_buffer_from(&vec![T::zeroed(); len])
    }

    /// The upload has completed when this returns
    pub(crate) fn create_buffer_from<T: DeviceRecord>(&self, data: &[T]) -> Result<ClMemBuffer<T>> {
        // zero-sized allocations are invalid in OpenCL
        let mut buffer = unsafe {
            ClMemBuffer::<T>::create(&self.context, CL_MEM_READ_WRITE, data.len().max(1), null_mut())
                .map_err(self.fail("unable to create buffer"))?
        };
        if !data.is_empty() {
            unsafe {
                self.queues[0]
                    .enqueue_write_buffer(&mut buffer, CL_TRUE, 0, data, &[])
                    .map_err(self.fail("failed to write buffer"))?;
            }
        }
        Ok(buffer)
    }

    pub(crate) fn write_buffer<T: DeviceRecord>(
        &self,
        queue: u32,
        buffer: &Arc<Mutex<ClMemBuffer<T>>>,
        offset: usize,
        data: &[T],
        wait: Option<&Event>,
    ) -> Result<Event> {
        let dependencies = match self.resolve_wait(wait)? {
            WaitList::Ready(dependencies) => dependencies,
            WaitList::Failed(e) => return Ok(Event::failed(e)),
        };
        if data.is_empty() {
            return self.marker_after(queue, &dependencies);
        }

        // the staging copy lives until the transfer has completed
        let staging: Box<[T]> = data.into();
        let mut target = buffer.lock();
        let event = unsafe {
            self.queues[queue as usize]
                .enqueue_write_buffer(&mut *target, CL_FALSE, offset * size_of::<T>(), &staging, &dependencies.raw())
                .map_err(self.fail("failed to write buffer"))?
        };
        Ok(self.event(event, &dependencies, Some(Box::new(staging))))
    }

    pub(crate) fn read_buffer<T: DeviceRecord>(
        &self,
        queue: u32,
        buffer: &Arc<Mutex<ClMemBuffer<T>>>,
        offset: usize,
        len: usize,
        destination: &Arc<Mutex<Vec<T>>>,
        wait: Option<&Event>,
    ) -> Result<Event> {
        let dependencies = match self.resolve_wait(wait)? {
            WaitList::Ready(dependencies) => dependencies,
            WaitList::Failed(e) => return Ok(Event::failed(e)),
        };
        if len == 0 {
            return self.marker_after(queue, &dependencies);
        }

        // The destination is sized once here and not touched again until the event completes,
        // so the slice handed to OpenCL stays valid.
        let source = buffer.lock();
        let mut data = destination.lock();
        data.resize(len, T::zeroed());
        let event = unsafe {
            self.queues[queue as usize]
                .enqueue_read_buffer(&*source, CL_FALSE, offset * size_of::<T>(), &mut data[..], &dependencies.raw())
                .map_err(self.fail("failed to read buffer"))?
        };
        Ok(self.event(event, &dependencies, Some(Box::new(destination.clone()))))
    }

    fn marker_after(&self, queue: u32, dependencies: &Dependencies) -> Result<Event> {
        let event = self.queues[queue as usize]
            .enqueue_marker_with_wait_list(&dependencies.raw())
            .map_err(self.fail("failed to enqueue marker"))?;
        Ok(self.event(event, dependencies, None))
    }

    pub(crate) fn marker(&self, queue: u32, wait: Option<&Event>) -> Result<Event> {
        match self.resolve_wait(wait)? {
            WaitList::Ready(dependencies) => self.marker_after(queue, &dependencies),
            WaitList::Failed(e) => Ok(Event::failed(e)),
        }
    }

    pub(crate) fn launch(&self, queue: u32, launch: TraversalLaunch, wait: Option<&Event>) -> Result<Event> {
        let dependencies = match self.resolve_wait(wait)? {
            WaitList::Ready(dependencies) => dependencies,
            WaitList::Failed(e) => return Ok(Event::failed(e)),
        };
        if launch.max_rays == 0 {
            return self.marker_after(queue, &dependencies);
        }

        fn mem<T: DeviceRecord>(buffer: &super::Buffer<T>) -> Result<cl_mem> {
            Ok(buffer.cl_buffer()?.lock().get())
        }

        let placeholder = self.placeholder.get();
        let nodes = mem(&launch.nodes)?;
        let primitive_indices = mem(&launch.primitive_indices)?;
        let (kind, triangles, segments, radii): (cl_int, cl_mem, cl_mem, cl_mem) = match &launch.leaves {
            LeafBuffers::Triangles { primitives } => (0, mem(primitives)?, placeholder, placeholder),
            LeafBuffers::Curves { segments, radii } => (1, placeholder, mem(segments)?, mem(radii)?),
        };
        let rays = mem(&launch.rays)?;
        let (counter, immediate_count, use_counter): (cl_mem, cl_uint, cl_int) = match &launch.count {
            RayCount::Immediate(count) => (placeholder, *count as cl_uint, 0),
            RayCount::Device(counter) => (mem(counter)?, 0, 1),
        };
        let (kernel, output) = match &launch.output {
            QueryOutput::Closest(hits) => (&self.closest, mem(hits)?),
            QueryOutput::Any(records) => (&self.any, mem(records)?),
        };
        let max_rays = launch.max_rays as cl_uint;
        let accumulate = launch.accumulate as cl_int;
        let inclusive_tmin = launch.inclusive_tmin as cl_int;

        let wait_list = dependencies.raw();
        let kernel = kernel.lock();
        let event = unsafe {
            ExecuteKernel::new(&kernel)
                .set_arg(&nodes)
                .set_arg(&primitive_indices)
                .set_arg(&kind)
                .set_arg(&triangles)
                .set_arg(&segments)
                .set_arg(&radii)
                .set_arg(&rays)
                .set_arg(&counter)
                .set_arg(&immediate_count)
                .set_arg(&use_counter)
                .set_arg(&max_rays)
                .set_arg(&accumulate)
                .set_arg(&inclusive_tmin)
                .set_arg(&output)
                .set_global_work_size(launch.max_rays)
                .set_event_wait_list(&wait_list)
                .enqueue_nd_range(&self.queues[queue as usize])
                .map_err(self.fail("failed to enqueue traversal"))?
        };
        debug!("{}: enqueued traversal of up to {} rays", self.name, launch.max_rays);

        // buffers of an in-flight launch stay alive until it completes
        Ok(self.event(event, &dependencies, Some(Box::new(launch))))
    }
}

fn device_info(device: &ClDevice) -> std::result::Result<DeviceInfo, opencl3::error_codes::ClError> {
    let device_type = device.dev_type()?;
    let device_type = if device_type & CL_DEVICE_TYPE_GPU != 0 {
        DeviceType::Gpu
    } else if device_type & CL_DEVICE_TYPE_ACCELERATOR != 0 {
        DeviceType::Accelerator
    } else {
        DeviceType::Cpu
    };
    let extensions = device.extensions()?;

    Ok(DeviceInfo {
        name: device.name()?,
        vendor: device.vendor()?,
        device_type,
        compute_units: device.max_compute_units()?,
        has_gl_interop: extensions.contains("cl_khr_gl_sharing") || extensions.contains("cl_APPLE_gl_sharing"),
    })
}

/// Enumerates OpenCL platforms and opens devices on them.
///
/// Shared contexts need platform-specific properties (display handles, GL context); the
/// caller builds them and passes them in with `with_shared_context`.
#[derive(Clone)]
pub struct ClEnumerator {
    queue_count: u32,
    shared_properties: Option<Vec<cl_context_properties>>,
    // devices reported by the last `platforms` call, indexed the same way
    enumerated: Arc<Mutex<Vec<Vec<ClDevice>>>>,
}

impl Default for ClEnumerator {
    fn default() -> Self {
        ClEnumerator {
            queue_count: 2,
            shared_properties: None,
            enumerated: Arc::default(),
        }
    }
}

impl fmt::Debug for ClEnumerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClEnumerator")
            .field("queue_count", &self.queue_count)
            .field("shared_context", &self.shared_properties.is_some())
            .finish()
    }
}

impl ClEnumerator {
    pub fn new() -> ClEnumerator {
        ClEnumerator::default()
    }

    pub fn with_queue_count(mut self, queue_count: u32) -> ClEnumerator {
        self.queue_count = queue_count;
        self
    }

    /// Zero-terminated `cl_context_properties` for the interop context
    pub fn with_shared_context(mut self, properties: Vec<cl_context_properties>) -> ClEnumerator {
        self.shared_properties = Some(properties);
        self
    }

    fn lookup(&self, platform: usize, device: usize) -> Option<ClDevice> {
        self.enumerated.lock().get(platform)?.get(device).cloned()
    }
}

impl DeviceEnumerator for ClEnumerator {
    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        let platforms = match get_platforms() {
            Ok(platforms) => platforms,
            Err(e) => {
                warn!("no OpenCL platforms: {}", e);
                self.enumerated.lock().clear();
                return Ok(Vec::new());
            }
        };

        let mut infos = Vec::with_capacity(platforms.len());
        let mut enumerated = Vec::with_capacity(platforms.len());
        for platform in &platforms {
            let name = platform.name().unwrap_or_default();
            let ids = platform.get_devices(CL_DEVICE_TYPE_ALL).unwrap_or_default();
            let mut devices = Vec::with_capacity(ids.len());
            let mut usable = Vec::with_capacity(ids.len());
            for id in ids {
                let device = ClDevice::new(id);
                match device_info(&device) {
                    Ok(info) => {
                        devices.push(info);
                        usable.push(device);
                    }
                    Err(e) => warn!("skipping device on platform {}: {}", name, e),
                }
            }
            infos.push(PlatformInfo { name, devices });
            enumerated.push(usable);
        }

        *self.enumerated.lock() = enumerated;
        Ok(infos)
    }

    fn create_device(&self, platform: usize, device: usize, context: ContextKind) -> Result<Device> {
        let cl_device = match self.lookup(platform, device) {
            Some(cl_device) => cl_device,
            None => {
                self.platforms()?;
                self.lookup(platform, device).ok_or(Error::NoComputeDevices)?
            }
        };
        let info = device_info(&cl_device).map_err(|e| Error::device_unavailable("opencl", e))?;

        let properties = match context {
            ContextKind::Compute => None,
            ContextKind::Shared => Some(
                self.shared_properties
                    .as_deref()
                    .ok_or_else(|| Error::device_unavailable(&info.name, "no shared context properties"))?,
            ),
        };

        let lost = Arc::new(AtomicBool::new(false));
        let backend = ClBackend::open(&info.name, &cl_device, properties, self.queue_count, lost.clone())?;
        Ok(Device::from_opencl(info, context, lost, backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Mode,
        coordinator::MultiDeviceCoordinator,
        device::{HostDeviceSettings, HostEvent},
        engine::IntersectionEngine,
        ray::Ray,
        scene::test_scenes,
        settings::EngineSettings,
    };

    // None when the machine has no OpenCL runtime
    fn opencl_coordinator() -> Option<MultiDeviceCoordinator> {
        let enumerator = ClEnumerator::new();
        if enumerator.platforms().unwrap().iter().all(|p| p.devices.is_empty()) {
            return None;
        }
        Some(MultiDeviceCoordinator::new(&enumerator, Mode::AllDevices, false, EngineSettings::default()).unwrap())
    }

    fn host_engine() -> IntersectionEngine {
        let info = DeviceInfo {
            name: "host-reference".to_owned(),
            vendor: "host".to_owned(),
            device_type: DeviceType::Cpu,
            compute_units: 2,
            has_gl_interop: false,
        };
        IntersectionEngine::new(
            Arc::new(Device::host(info, &HostDeviceSettings::default()).unwrap()),
            EngineSettings::default(),
        )
    }

    #[test]
    fn test_kernel_matches_host_traversal() {
        let Some(mut coordinator) = opencl_coordinator() else {
            return;
        };
        let mut host = host_engine();

        for world in [test_scenes::mixed(3), test_scenes::triangle_grid(4)] {
            let mut rays = test_scenes::random_rays(2_000, 17);
            rays.extend(test_scenes::grid_aligned_rays(4));
            coordinator.process(&world).unwrap();
            host.process(&world).unwrap();

            let expected = host.intersect_rays(&rays).unwrap();
            let hits = coordinator.intersect(&rays).unwrap();
            for (hit, expected) in hits.iter().zip(&expected) {
                assert_eq!(hit.is_hit(), expected.is_hit());
                if hit.is_hit() {
                    assert!((hit.t - expected.t).abs() < 1e-4, "{} != {}", hit.t, expected.t);
                }
            }

            let occluded = coordinator.occluded(&rays).unwrap();
            for (record, expected) in occluded.iter().zip(&expected) {
                assert_eq!(*record != crate::ray::INVALID_ID, expected.is_hit());
            }
        }
    }

    #[test]
    fn test_host_dependency_is_bridged_without_blocking() {
        let Some(coordinator) = opencl_coordinator() else {
            return;
        };
        let device = coordinator.configurations()[0].device.clone();
        let buffer = device.create_buffer::<u32>(4).unwrap();

        // a pending host event must not block the submitting thread
        let gate = HostEvent::new();
        let written = device
            .write_buffer(0, &buffer, 0, &[1, 2, 3, 4], Some(&Event::from_host(gate.clone())))
            .unwrap();
        let readback = device.read_buffer(0, &buffer, 0, 4, Some(&written)).unwrap();
        assert!(!readback.event().is_complete());
        gate.complete();
        assert_eq!(readback.wait().unwrap(), vec![1, 2, 3, 4]);

        // a failed host dependency fails the chain but leaves the device usable
        let failed = HostEvent::new();
        let skipped = device
            .write_buffer(0, &buffer, 0, &[9; 4], Some(&Event::from_host(failed.clone())))
            .unwrap();
        failed.fail(Error::EmptyScene);
        let readback = device.read_buffer(0, &buffer, 0, 4, Some(&skipped)).unwrap();
        assert_eq!(readback.wait().unwrap_err(), Error::EmptyScene);
        assert!(!device.is_lost());
        let ray = Ray::new(crate::geometry::Vec3(0.0, 0.0, 1.0), crate::geometry::Vec3(0.0, 0.0, -1.0));
        assert!(device.create_buffer_from(&[ray]).is_ok());
    }
}
