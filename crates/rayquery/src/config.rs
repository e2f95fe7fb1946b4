//! Device enumeration and configuration.
//!
//! A configuration is one device context plus the per-device renderer state bound to it.
//! Exactly one configuration is the Primary: the one whose results are presented. When
//! display interop is requested, the first interop-capable device gets a context shared with
//! the display and becomes Primary.

use std::{fmt, str::FromStr, sync::Arc};

use tracing::{info, warn};

use crate::{
    device::{ContextKind, Device, DeviceInfo, DeviceType, HostDeviceSettings},
    error::{Error, Result},
};

#[cfg(feature = "opencl")]
pub use crate::device::opencl::ClEnumerator;

/// Which devices `create_configurations` keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    AllGpus,
    AllCpus,
    SingleGpu,
    SingleCpu,
    AllDevices,
}

impl Mode {
    pub fn accepts(&self, device_type: DeviceType) -> bool {
        match self {
            Mode::AllGpus | Mode::SingleGpu => device_type == DeviceType::Gpu,
            Mode::AllCpus | Mode::SingleCpu => device_type == DeviceType::Cpu,
            Mode::AllDevices => true,
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, Mode::SingleGpu | Mode::SingleCpu)
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Mode> {
        match s {
            "all-gpus" => Ok(Mode::AllGpus),
            "all-cpus" => Ok(Mode::AllCpus),
            "single-gpu" => Ok(Mode::SingleGpu),
            "single-cpu" => Ok(Mode::SingleCpu),
            "all" => Ok(Mode::AllDevices),
            _ => Err(Error::invalid_option("mode", s)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::AllGpus => "all-gpus",
            Mode::AllCpus => "all-cpus",
            Mode::SingleGpu => "single-gpu",
            Mode::SingleCpu => "single-cpu",
            Mode::AllDevices => "all",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformInfo {
    pub name: String,
    pub devices: Vec<DeviceInfo>,
}

/// A device selected for a configuration, before its context exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationPlan {
    pub platform: usize,
    pub device: usize,
    pub device_type: DeviceType,
    pub role: DeviceRole,
    pub can_interop: bool,
}

impl ConfigurationPlan {
    pub fn context_kind(&self) -> ContextKind {
        if self.can_interop {
            ContextKind::Shared
        } else {
            ContextKind::Compute
        }
    }
}

/// Selects devices for `mode` in platform order. Single modes stop at the first match.
pub fn plan_configurations(platforms: &[PlatformInfo], mode: Mode, interop: bool) -> Vec<ConfigurationPlan> {
    let mut plans: Vec<ConfigurationPlan> = Vec::new();
    let mut primary_claimed = false;

    'platforms: for (platform_idx, platform) in platforms.iter().enumerate() {
        for (device_idx, device) in platform.devices.iter().enumerate() {
            if !mode.accepts(device.device_type) {
                continue;
            }

            let shared = interop && !primary_claimed && device.has_gl_interop;
            primary_claimed |= shared;
            plans.push(ConfigurationPlan {
                platform: platform_idx,
                device: device_idx,
                device_type: device.device_type,
                role: if shared { DeviceRole::Primary } else { DeviceRole::Secondary },
                can_interop: shared,
            });

            if mode.is_single() {
                break 'platforms;
            }
        }
    }

    if !primary_claimed {
        if let Some(first) = plans.first_mut() {
            first.role = DeviceRole::Primary;
        }
    }
    plans
}

/// Source of compute devices
pub trait DeviceEnumerator {
    fn platforms(&self) -> Result<Vec<PlatformInfo>>;

    /// Opens device `device` of platform `platform` with the given context kind
    fn create_device(&self, platform: usize, device: usize, context: ContextKind) -> Result<Device>;
}

/// One device context and the renderer state created for it
pub struct DeviceConfiguration<R> {
    pub device: Arc<Device>,
    /// Index of the device within its context; contexts hold a single device
    pub device_slot: usize,
    pub role: DeviceRole,
    pub can_interop: bool,
    pub renderer: R,
}

impl<R> DeviceConfiguration<R> {
    pub fn is_primary(&self) -> bool {
        self.role == DeviceRole::Primary
    }
}

impl<R> fmt::Debug for DeviceConfiguration<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfiguration")
            .field("device", &self.device.name())
            .field("role", &self.role)
            .field("can_interop", &self.can_interop)
            .finish()
    }
}

/// Enumerates devices, opens one context per selected device and creates its renderer.
///
/// When a shared context cannot be created the device falls back to a compute context and
/// keeps its Primary role without interop.
pub fn create_configurations<E, R, F>(
    enumerator: &E,
    mode: Mode,
    interop: bool,
    mut make_renderer: F,
) -> Result<Vec<DeviceConfiguration<R>>>
where
    E: DeviceEnumerator + ?Sized,
    F: FnMut(&Arc<Device>, usize) -> Result<R>,
{
    let platforms = enumerator.platforms()?;
    if platforms.is_empty() {
        return Err(Error::NoComputeDevices);
    }

    let plans = plan_configurations(&platforms, mode, interop);
    if plans.is_empty() {
        return Err(Error::NoComputeDevices);
    }

    let mut configs = Vec::with_capacity(plans.len());
    for plan in plans {
        let (device, can_interop) = match enumerator.create_device(plan.platform, plan.device, plan.context_kind()) {
            Ok(device) => (device, plan.can_interop),
            Err(e) if plan.can_interop => {
                warn!("shared context unavailable, falling back to compute context: {}", e);
                let device = enumerator.create_device(plan.platform, plan.device, ContextKind::Compute)?;
                (device, false)
            }
            Err(e) => return Err(e),
        };

        let device = Arc::new(device);
        let device_slot = 0;
        let renderer = make_renderer(&device, device_slot)?;
        info!(
            "configured {} ({}) as {:?}{}",
            device.name(),
            plan.device_type,
            plan.role,
            if can_interop { " with interop" } else { "" }
        );

        configs.push(DeviceConfiguration {
            device,
            device_slot,
            role: plan.role,
            can_interop,
            renderer,
        });
    }

    Ok(configs)
}

/// Enumerator backed by host devices. By default it reports the machine's CPU as a single
/// platform; `with_platforms` describes any other topology, each device then running on host
/// threads.
#[derive(Debug, Clone)]
pub struct HostEnumerator {
    platforms: Vec<PlatformInfo>,
    settings: HostDeviceSettings,
    display_available: bool,
}

impl Default for HostEnumerator {
    fn default() -> Self {
        HostEnumerator::new()
    }
}

impl HostEnumerator {
    pub fn new() -> HostEnumerator {
        let compute_units = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let cpu = DeviceInfo {
            name: "host-cpu".to_owned(),
            vendor: "host".to_owned(),
            device_type: DeviceType::Cpu,
            compute_units,
            has_gl_interop: false,
        };

        HostEnumerator::with_platforms(vec![PlatformInfo {
            name: "host".to_owned(),
            devices: vec![cpu],
        }])
    }

    pub fn with_platforms(platforms: Vec<PlatformInfo>) -> HostEnumerator {
        HostEnumerator {
            platforms,
            settings: HostDeviceSettings::default(),
            display_available: true,
        }
    }

    pub fn with_settings(mut self, settings: HostDeviceSettings) -> HostEnumerator {
        self.settings = settings;
        self
    }

    /// Shared context creation fails, as on a machine without a display
    pub fn without_display(mut self) -> HostEnumerator {
        self.display_available = false;
        self
    }
}

impl DeviceEnumerator for HostEnumerator {
    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        Ok(self.platforms.clone())
    }

    fn create_device(&self, platform: usize, device: usize, context: ContextKind) -> Result<Device> {
        let info = self
            .platforms
            .get(platform)
            .and_then(|p| p.devices.get(device))
            .ok_or(Error::NoComputeDevices)?;

        if context == ContextKind::Shared && !(self.display_available && info.has_gl_interop) {
            return Err(Error::device_unavailable(&info.name, "unable to share context with display"));
        }

        Ok(Device::host(info.clone(), &self.settings)?.with_context_kind(context))
    }
}
