//! Ray intersection engine: scene geometry is flattened into a primitive store, indexed with
//! an SAH bounding volume hierarchy and queried for closest or any hits in batches on one or
//! more compute devices.

pub mod accel;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod intersector;
mod macros;
pub mod primitives;
pub mod ray;
pub mod scene;
pub mod settings;
pub mod world;


pub use config::{create_configurations, DeviceConfiguration, DeviceEnumerator, DeviceRole, HostEnumerator, Mode};
pub use coordinator::MultiDeviceCoordinator;
pub use device::{Buffer, ContextKind, Device, DeviceInfo, DeviceType, Event, HostDeviceSettings, Readback};
pub use engine::{IntersectionEngine, StagedScene};
pub use error::{Error, Result};
pub use intersector::{Intersector, PreparedScene, RayCount, RayQuery};
pub use ray::{Hit, Ray, RayFlags, INVALID_ID};
pub use settings::{EngineSettings, QueryOptions};
pub use world::{Geometry, ShapeId, World};

#[cfg(feature = "opencl")]
pub use config::ClEnumerator;
