//! Error taxonomy shared by every component of the crate

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Enumeration found no platform or no device matching the requested mode
    #[error("no compute devices available")]
    NoComputeDevices,

    /// The device or its context became invalid; fatal to the owning configuration
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("scene contains no primitives")]
    EmptyScene,

    #[error("invalid geometry in shape {shape}, primitive {primitive}: {reason}")]
    InvalidGeometry {
        shape: u32,
        primitive: u32,
        reason: &'static str,
    },

    /// Ray count exceeds the capacity of a buffer bound to the batch
    #[error("ray batch of {requested} exceeds buffer capacity of {capacity}")]
    InvalidBatch { requested: usize, capacity: usize },

    #[error("no world has been processed")]
    NotProcessed,

    #[error("spatial index built from store version {index_version}, bound against version {store_version}")]
    StaleIndex { index_version: u64, store_version: u64 },

    #[error("buffer was allocated on a different device")]
    ForeignBuffer,

    #[error("queue {queue} out of range ({count} queues)")]
    InvalidQueue { queue: u32, count: u32 },

    #[error("invalid option {name}={value}")]
    InvalidOption { name: String, value: String },
}

impl Error {
    pub(crate) fn device_unavailable(device: &str, reason: impl ToString) -> Error {
        Error::DeviceUnavailable {
            device: device.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_option(name: &str, value: &str) -> Error {
        Error::InvalidOption {
            name: name.to_owned(),
            value: value.to_owned(),
        }
    }

    /// Errors after which the owning configuration cannot be used any more
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NoComputeDevices | Error::DeviceUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
