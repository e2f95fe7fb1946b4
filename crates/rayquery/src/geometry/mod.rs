mod aabb;
mod vec3;

pub use aabb::AABB;
pub use vec3::Axis;
pub use vec3::Vec3;
pub use vec3::Vec3u;
