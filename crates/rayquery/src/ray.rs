use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::geometry::Vec3;

/// Sentinel id meaning "no hit" in hit and occlusion records
pub const INVALID_ID: u32 = u32::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RayFlags: u32 {
        // zeroed rays are active; inactive rays are skipped without touching the index
        const INACTIVE = 1 << 0;
        const CULL_BACKFACES = 1 << 1;
    }
}

/// Device-layout ray. Valid hits lie in `(tmin, tmax]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Ray {
    pub origin: [f32; 3],
    pub tmin: f32,
    pub direction: [f32; 3],
    pub tmax: f32,
    pub mask: u32,
    pub flags: u32,
    _padding: [u32; 2],
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Ray {
        Ray::with_range(origin, direction, 0.0, f32::INFINITY)
    }

    pub fn with_range(origin: Vec3, direction: Vec3, tmin: f32, tmax: f32) -> Ray {
        Ray {
            origin: origin.into(),
            tmin,
            direction: direction.into(),
            tmax,
            mask: u32::MAX,
            flags: RayFlags::empty().bits(),
            _padding: [0; 2],
        }
    }

    pub fn with_mask(mut self, mask: u32) -> Ray {
        self.mask = mask;
        self
    }

    pub fn with_flags(mut self, flags: RayFlags) -> Ray {
        self.flags = flags.bits();
        self
    }

    pub fn origin(&self) -> Vec3 {
        self.origin.into()
    }

    pub fn direction(&self) -> Vec3 {
        self.direction.into()
    }

    pub fn flags(&self) -> RayFlags {
        RayFlags::from_bits_truncate(self.flags)
    }

    pub fn at(&self, t: f32) -> Vec3 {
        self.origin() + self.direction() * t
    }

    /// Inactive rays and degenerate ranges never produce a hit
    pub fn is_traceable(&self) -> bool {
        !self.flags().contains(RayFlags::INACTIVE)
            && !self.tmin.is_nan()
            && !self.tmax.is_nan()
            && self.tmin < self.tmax
    }
}

/// Closest-hit record. `prim_id == INVALID_ID` means the ray hit nothing.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Hit {
    pub shape_id: u32,
    pub prim_id: u32,
    /// Barycentrics for triangles; segment parameter and 0 for curves
    pub uv: [f32; 2],
    pub t: f32,
    _padding: u32,
}

impl Hit {
    pub const MISS: Hit = Hit {
        shape_id: INVALID_ID,
        prim_id: INVALID_ID,
        uv: [0.0, 0.0],
        t: f32::INFINITY,
        _padding: 0,
    };

    pub fn new(shape_id: u32, prim_id: u32, uv: [f32; 2], t: f32) -> Hit {
        Hit {
            shape_id,
            prim_id,
            uv,
            t,
            _padding: 0,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.prim_id != INVALID_ID
    }
}

impl Default for Hit {
    fn default() -> Self {
        Hit::MISS
    }
}

/// Occlusion results are one id per ray: the occluding shape, or `INVALID_ID`
pub fn is_occluded(record: u32) -> bool {
    record != INVALID_ID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes_match_device_layout() {
        assert_eq!(std::mem::size_of::<Ray>(), 48);
        assert_eq!(std::mem::size_of::<Hit>(), 24);
    }

    #[test]
    fn test_degenerate_range_is_not_traceable() {
        let o = Vec3(0.0, 0.0, 0.0);
        let d = Vec3(0.0, 0.0, 1.0);
        assert!(Ray::new(o, d).is_traceable());
        assert!(!Ray::with_range(o, d, 1.0, 1.0).is_traceable());
        assert!(!Ray::with_range(o, d, 2.0, 1.0).is_traceable());
        assert!(!Ray::with_range(o, d, f32::NAN, 1.0).is_traceable());
        assert!(!Ray::new(o, d).with_flags(RayFlags::INACTIVE).is_traceable());
    }

    #[test]
    fn test_zeroed_hit_is_not_a_miss_but_default_is() {
        assert!(Hit::zeroed().is_hit());
        assert!(!Hit::default().is_hit());
    }
}
