//! Compute devices with in-order queues, device-resident buffers and completion events.
//!
//! Every enqueue returns immediately with an [`Event`]; nothing blocks unless the caller waits
//! on one. The host backend is always available. The OpenCL backend is compiled in with the
//! `opencl` cargo feature.

mod event;
mod host;
#[cfg(feature = "opencl")]
pub(crate) mod opencl;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use bytemuck::Pod;
use parking_lot::{Mutex, RwLock};
use tracing::error;

pub use event::Event;
pub(crate) use event::HostEvent;
pub use host::HostDeviceSettings;

use crate::{
    error::{Error, Result},
    intersector::traverse::TraversalLaunch,
};
use host::HostBackend;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Element types that may live in device memory
pub trait DeviceRecord: Pod + Send + Sync {}

impl<T: Pod + Send + Sync> DeviceRecord for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::Accelerator => "accelerator",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub device_type: DeviceType,
    pub compute_units: u32,
    /// Whether the device can share a context with the display
    pub has_gl_interop: bool,
}

/// How the device context was created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Compute,
    /// Shared with the display so results can be presented without a copy
    Shared,
}

#[derive(Clone)]
pub(crate) enum Storage<T: DeviceRecord> {
    Host(Arc<RwLock<Vec<T>>>),
    #[cfg(feature = "opencl")]
    OpenCl(Arc<Mutex<opencl3::memory::Buffer<T>>>),
}

/// Fixed-size typed allocation on one device. Cloning the handle does not copy the data.
#[derive(Clone)]
pub struct Buffer<T: DeviceRecord> {
    device_id: u64,
    len: usize,
    storage: Storage<T>,
}

impl<T: DeviceRecord> Buffer<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub(crate) fn host_data(&self) -> Result<&Arc<RwLock<Vec<T>>>> {
        match &self.storage {
            Storage::Host(data) => Ok(data),
            #[cfg(feature = "opencl")]
            _ => Err(Error::ForeignBuffer),
        }
    }

    #[cfg(feature = "opencl")]
    pub(crate) fn cl_buffer(&self) -> Result<&Arc<Mutex<opencl3::memory::Buffer<T>>>> {
        match &self.storage {
            Storage::OpenCl(buffer) => Ok(buffer),
            _ => Err(Error::ForeignBuffer),
        }
    }
}

impl<T: DeviceRecord> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("device_id", &self.device_id)
            .field("len", &self.len)
            .finish()
    }
}

/// Pending copy of device data back to the host
pub struct Readback<T> {
    event: Event,
    data: Arc<Mutex<Vec<T>>>,
}

impl<T> Readback<T> {
    /// Readback whose data is already on the host
    pub(crate) fn ready(data: Vec<T>) -> Readback<T> {
        Readback {
            event: Event::completed(),
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn wait(self) -> Result<Vec<T>> {
        self.event.wait()?;
        let mut data = self.data.lock();
        Ok(std::mem::take(&mut *data))
    }
}

enum Backend {
    Host(HostBackend),
    #[cfg(feature = "opencl")]
    OpenCl(opencl::ClBackend),
}

pub struct Device {
    id: u64,
    info: DeviceInfo,
    context: ContextKind,
    lost: Arc<AtomicBool>,
    backend: Backend,
}

impl Device {
    /// Device executing on host threads
    pub fn host(info: DeviceInfo, settings: &HostDeviceSettings) -> Result<Device> {
        let lost = Arc::new(AtomicBool::new(false));
        let threads = settings
            .threads
            .unwrap_or(info.compute_units as usize)
            .max(1);
        let backend = HostBackend::new(&info.name, settings.queue_count, threads, lost.clone())?;

        Ok(Device {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            info,
            context: ContextKind::Compute,
            lost,
            backend: Backend::Host(backend),
        })
    }

    pub(crate) fn with_context_kind(mut self, context: ContextKind) -> Device {
        self.context = context;
        self
    }

    #[cfg(feature = "opencl")]
    pub(crate) fn from_opencl(
        info: DeviceInfo,
        context: ContextKind,
        lost: Arc<AtomicBool>,
        backend: opencl::ClBackend,
    ) -> Device {
        Device {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            info,
            context,
            lost,
            backend: Backend::OpenCl(backend),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn context_kind(&self) -> ContextKind {
        self.context
    }

    pub fn queue_count(&self) -> u32 {
        match &self.backend {
            Backend::Host(host) => host.queue_count(),
            #[cfg(feature = "opencl")]
            Backend::OpenCl(cl) => cl.queue_count(),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Declares the device lost. Queued work fails and later submissions are refused.
    pub fn invalidate(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            error!("device {} invalidated", self.info.name);
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.is_lost() {
            return Err(Error::device_unavailable(&self.info.name, "device lost"));
        }
        Ok(())
    }

    fn check_queue(&self, queue: u32) -> Result<()> {
        let count = self.queue_count();
        if queue >= count {
            return Err(Error::InvalidQueue { queue, count });
        }
        Ok(())
    }

    pub(crate) fn check_buffer<T: DeviceRecord>(&self, buffer: &Buffer<T>) -> Result<()> {
        if buffer.device_id != self.id {
            return Err(Error::ForeignBuffer);
        }
        Ok(())
    }

    fn check_range<T: DeviceRecord>(buffer: &Buffer<T>, offset: usize, len: usize) -> Result<()> {
        let end = offset.saturating_add(len);
        if end > buffer.len {
            return Err(Error::InvalidBatch {
                requested: end,
                capacity: buffer.len,
            });
        }
        Ok(())
    }

    /// Zero-initialized buffer of `len` elements
    pub fn create_buffer<T: DeviceRecord>(&self, len: usize) -> Result<Buffer<T>> {
        self.check_available()?;
        let storage = match &self.backend {
            Backend::Host(_) => Storage::Host(Arc::new(RwLock::new(vec![T::zeroed(); len]))),
            #[cfg(feature = "opencl")]
            Backend::OpenCl(cl) => Storage::OpenCl(Arc::new(Mutex::new(cl.create_buffer(len)?))),
        };

        Ok(Buffer {
            device_id: self.id,
            len,
            storage,
        })
    }

    /// Buffer initialized from host data; the upload has completed when this returns
    pub fn create_buffer_from<T: DeviceRecord>(&self, data: &[T]) -> Result<Buffer<T>> {
        self.check_available()?;
        let storage = match &self.backend {
            Backend::Host(_) => Storage::Host(Arc::new(RwLock::new(data.to_vec()))),
            #[cfg(feature = "opencl")]
            Backend::OpenCl(cl) => {
                Storage::OpenCl(Arc::new(Mutex::new(cl.create_buffer_from(data)?)))
            }
        };

        Ok(Buffer {
            device_id: self.id,
            len: data.len(),
            storage,
        })
    }

    pub fn write_buffer<T: DeviceRecord>(
        &self,
        queue: u32,
        buffer: &Buffer<T>,
        offset: usize,
        data: &[T],
        wait: Option<&Event>,
    ) -> Result<Event> {
        self.check_available()?;
        self.check_queue(queue)?;
        self.check_buffer(buffer)?;
        Device::check_range(buffer, offset, data.len())?;

        match &self.backend {
            Backend::Host(host) => {
                let target = buffer.host_data()?.clone();
                let data = data.to_vec();
                host.submit(
                    queue,
                    wait,
                    Box::new(move |_| {
                        let mut target = target.write();
                        target[offset..offset + data.len()].copy_from_slice(&data);
                        Ok(())
                    }),
                )
            }
            #[cfg(feature = "opencl")]
            Backend::OpenCl(cl) => cl.write_buffer(queue, buffer.cl_buffer()?, offset, data, wait),
        }
    }

    pub fn read_buffer<T: DeviceRecord>(
        &self,
        queue: u32,
        buffer: &Buffer<T>,
        offset: usize,
        len: usize,
        wait: Option<&Event>,
    ) -> Result<Readback<T>> {
        self.check_available()?;
        self.check_queue(queue)?;
        self.check_buffer(buffer)?;
        Device::check_range(buffer, offset, len)?;

        let data = Arc::new(Mutex::new(Vec::new()));
        let event = match &self.backend {
            Backend::Host(host) => {
                let source = buffer.host_data()?.clone();
                let destination = data.clone();
                host.submit(
                    queue,
                    wait,
                    Box::new(move |_| {
                        let source = source.read();
                        *destination.lock() = source[offset..offset + len].to_vec();
                        Ok(())
                    }),
                )?
            }
            #[cfg(feature = "opencl")]
            Backend::OpenCl(cl) => {
                cl.read_buffer(queue, buffer.cl_buffer()?, offset, len, &data, wait)?
            }
        };

        Ok(Readback { event, data })
    }

    /// Event signalled once everything submitted to `queue` so far (and `wait`) has completed
    pub fn marker(&self, queue: u32, wait: Option<&Event>) -> Result<Event> {
        self.check_available()?;
        self.check_queue(queue)?;
        match &self.backend {
            Backend::Host(host) => host.submit(queue, wait, Box::new(|_| Ok(()))),
            #[cfg(feature = "opencl")]
            Backend::OpenCl(cl) => cl.marker(queue, wait),
        }
    }

    /// Blocks until all work submitted to `queue` has completed
    pub fn finish(&self, queue: u32) -> Result<()> {
        self.marker(queue, None)?.wait()
    }

    pub(crate) fn launch(
        &self,
        queue: u32,
        launch: TraversalLaunch,
        wait: Option<&Event>,
    ) -> Result<Event> {
        self.check_available()?;
        self.check_queue(queue)?;
        launch.check_device(self)?;

        match &self.backend {
            Backend::Host(host) => host.submit(
                queue,
                wait,
                Box::new(move |pool| crate::intersector::traverse::execute(&launch, pool)),
            ),
            #[cfg(feature = "opencl")]
            Backend::OpenCl(cl) => cl.launch(queue, launch, wait),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .field("type", &self.info.device_type)
            .field("lost", &self.is_lost())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device(queue_count: u32) -> Device {
        let info = DeviceInfo {
            name: "test-cpu".to_owned(),
            vendor: "host".to_owned(),
            device_type: DeviceType::Cpu,
            compute_units: 2,
            has_gl_interop: false,
        };
        Device::host(
            info,
            &HostDeviceSettings {
                queue_count,
                threads: Some(2),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_write_then_read_observes_queue_order() {
        let device = test_device(1);
        let buffer = device.create_buffer::<u32>(4).unwrap();
        device.write_buffer(0, &buffer, 0, &[1, 2, 3, 4], None).unwrap();
        device.write_buffer(0, &buffer, 2, &[9], None).unwrap();
        let data = device.read_buffer(0, &buffer, 0, 4, None).unwrap().wait().unwrap();
        assert_eq!(data, vec![1, 2, 9, 4]);
    }

    #[test]
    fn test_cross_queue_ordering_through_events() {
        let device = test_device(2);
        let buffer = device.create_buffer_from(&[0u32; 8]).unwrap();
        let written = device.write_buffer(0, &buffer, 0, &[5; 8], None).unwrap();
        let data = device
            .read_buffer(1, &buffer, 0, 8, Some(&written))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(data, vec![5; 8]);
    }

    #[test]
    fn test_rejects_bad_arguments_before_submission() {
        let device = test_device(1);
        let other = test_device(1);
        let buffer = device.create_buffer::<u32>(2).unwrap();
        let foreign = other.create_buffer::<u32>(2).unwrap();

        assert_eq!(
            device.write_buffer(3, &buffer, 0, &[1], None).unwrap_err(),
            Error::InvalidQueue { queue: 3, count: 1 }
        );
        assert_eq!(
            device.write_buffer(0, &foreign, 0, &[1], None).unwrap_err(),
            Error::ForeignBuffer
        );
        assert_eq!(
            device.read_buffer(0, &buffer, 1, 2, None).err(),
            Some(Error::InvalidBatch { requested: 3, capacity: 2 })
        );
    }

    #[test]
    fn test_lost_device_refuses_work() {
        let device = test_device(1);
        let buffer = device.create_buffer::<u32>(1).unwrap();
        device.invalidate();
        assert!(device.is_lost());
        assert!(matches!(
            device.write_buffer(0, &buffer, 0, &[1], None),
            Err(Error::DeviceUnavailable { .. })
        ));
        assert!(matches!(device.create_buffer::<u32>(1), Err(Error::DeviceUnavailable { .. })));
    }
}
