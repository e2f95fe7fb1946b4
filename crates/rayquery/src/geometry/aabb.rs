use std::ops::Range;

use super::vec3::Vec3;
use crate::macros::{variadic_max_comparator, variadic_min_comparator};

/// Axis-aligned bounding box
/// Defined by 2 points
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AABB {
    pub minimum: Vec3,
    pub maximum: Vec3
}

impl Default for AABB {
    fn default() -> Self {
        AABB::empty()
    }
}

macro_rules! from_points {
    ($($y:expr),+) => (
        AABB {
            minimum: variadic_min_comparator!(Vec3::elementwise_min, $($y),+),
            maximum: variadic_max_comparator!(Vec3::elementwise_max, $($y),+),
        }
    );
}

impl AABB {
    pub fn new(minimum: Vec3, maximum: Vec3) -> AABB {
        AABB { minimum, maximum }
    }

    /// Inverted box that contains nothing; the identity for `surrounding_box`
    pub fn empty() -> AABB {
        AABB {
            minimum: Vec3::splat(f32::INFINITY),
            maximum: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.minimum.0 > self.maximum.0
            || self.minimum.1 > self.maximum.1
            || self.minimum.2 > self.maximum.2
    }

    /// Returns a box which surrounds both a and b
    pub fn surrounding_box(a: AABB, b: AABB) -> AABB {
        AABB {
            minimum: Vec3::elementwise_min(a.minimum, b.minimum),
            maximum: Vec3::elementwise_max(a.maximum, b.maximum),
        }
    }

    pub fn grow(&mut self, point: Vec3) {
        self.minimum = Vec3::elementwise_min(self.minimum, point);
        self.maximum = Vec3::elementwise_max(self.maximum, point);
    }

    pub fn triangle(p0: Vec3, p1: Vec3, p2: Vec3) -> AABB {
        from_points!(p0, p1, p2)
    }

    pub fn extent(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::zero()
        } else {
            self.maximum - self.minimum
        }
    }

    pub fn centroid(&self) -> Vec3 {
        (self.minimum + self.maximum) * 0.5
    }

    pub fn surface_area(&self) -> f32 {
        let d = self.extent();
        2.0 * (d.0 * d.1 + d.1 * d.2 + d.2 * d.0)
    }

    /// An empty box is contained in every box
    pub fn contains(&self, other: &AABB) -> bool {
        other.is_empty()
            || (self.minimum.0 <= other.minimum.0
                && self.minimum.1 <= other.minimum.1
                && self.minimum.2 <= other.minimum.2
                && self.maximum.0 >= other.maximum.0
                && self.maximum.1 >= other.maximum.1
                && self.maximum.2 >= other.maximum.2)
    }

    /// Slab test against a ray given by origin and reciprocal direction, clipped to `t_range`.
    /// Returns the overlapping parametric interval.
    pub fn intersect_ray(&self, origin: Vec3, inv_direction: Vec3, t_range: Range<f32>) -> Option<Range<f32>> {
        let x = slab(self.minimum.0, self.maximum.0, origin.0, inv_direction.0);
        let y = slab(self.minimum.1, self.maximum.1, origin.1, inv_direction.1);
        let z = slab(self.minimum.2, self.maximum.2, origin.2, inv_direction.2);

        let start = variadic_max_comparator!(f32::max, x.0, y.0, z.0, t_range.start);
        let end = variadic_min_comparator!(f32::min, x.1, y.1, z.1, t_range.end);

        if start <= end {
            Some(start..end)
        } else {
            None
        }
    }
}

/// Entry and exit distance for one axis. A zero direction component with the origin on a face
/// plane gives `0 * inf`; the ray then runs inside that plane and the axis does not clip it.
fn slab(minimum: f32, maximum: f32, origin: f32, inv_direction: f32) -> (f32, f32) {
    let t0 = (minimum - origin) * inv_direction;
    let t1 = (maximum - origin) * inv_direction;
    if t0.is_nan() || t1.is_nan() {
        (f32::NEG_INFINITY, f32::INFINITY)
    } else {
        (t0.min(t1), t0.max(t1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> AABB {
        AABB::new(Vec3(0.0, 0.0, 0.0), Vec3(1.0, 1.0, 1.0))
    }

    #[test]
    fn test_empty_box_is_identity_for_union() {
        let b = unit_box();
        assert_eq!(AABB::surrounding_box(AABB::empty(), b), b);
        assert!(AABB::empty().is_empty());
        assert_eq!(AABB::empty().surface_area(), 0.0);
    }

    #[test]
    fn test_surface_area() {
        assert_eq!(unit_box().surface_area(), 6.0);
        let flat = AABB::new(Vec3(0.0, 0.0, 0.0), Vec3(2.0, 3.0, 0.0));
        assert_eq!(flat.surface_area(), 12.0);
    }

    #[test]
    fn test_ray_hits_box_through_center() {
        let origin = Vec3(0.5, 0.5, -1.0);
        let inv = Vec3(f32::INFINITY, f32::INFINITY, 1.0);
        let hit = unit_box().intersect_ray(origin, inv, 0.0..f32::INFINITY);
        let hit = hit.expect("ray should hit box");
        assert!((hit.start - 1.0).abs() < 1e-6);
        assert!((hit.end - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_ray_misses_box_behind_range() {
        let origin = Vec3(0.5, 0.5, -1.0);
        let inv = Vec3(f32::INFINITY, f32::INFINITY, 1.0);
        assert!(unit_box().intersect_ray(origin, inv, 0.0..0.5).is_none());
        let away = Vec3(f32::INFINITY, f32::INFINITY, -1.0);
        assert!(unit_box().intersect_ray(origin, away, 0.0..f32::INFINITY).is_none());
    }

    #[test]
    fn test_ray_inside_face_plane_hits_box() {
        let flat = AABB::new(Vec3(0.5, 0.0, 0.0), Vec3(1.0, 0.5, 0.0));
        let down = Vec3(f32::INFINITY, f32::INFINITY, -1.0);
        for origin in [Vec3(0.5, 0.25, 1.0), Vec3(1.0, 0.25, 1.0), Vec3(0.5, 0.0, 1.0), Vec3(0.6, 0.25, 1.0)] {
            let hit = flat.intersect_ray(origin, down, 0.0..f32::INFINITY);
            assert_eq!(hit, Some(1.0..1.0), "origin {:?}", origin);
        }

        // negative zero direction components give -inf reciprocals
        let neg = Vec3(f32::NEG_INFINITY, f32::NEG_INFINITY, -1.0);
        assert_eq!(flat.intersect_ray(Vec3(1.0, 0.5, 1.0), neg, 0.0..f32::INFINITY), Some(1.0..1.0));
        // parallel and outside the slab still misses
        assert!(flat.intersect_ray(Vec3(1.5, 0.25, 1.0), down, 0.0..f32::INFINITY).is_none());
    }

    #[test]
    fn test_contains() {
        let outer = AABB::new(Vec3(-1.0, -1.0, -1.0), Vec3(2.0, 2.0, 2.0));
        assert!(outer.contains(&unit_box()));
        assert!(!unit_box().contains(&outer));
        assert!(unit_box().contains(&AABB::empty()));
    }

    #[test]
    fn test_triangle_bounds() {
        let b = AABB::triangle(Vec3(0.0, 1.0, 2.0), Vec3(-1.0, 0.0, 5.0), Vec3(3.0, -2.0, 0.0));
        assert_eq!(b.minimum, Vec3(-1.0, -2.0, 0.0));
        assert_eq!(b.maximum, Vec3(3.0, 1.0, 5.0));
    }
}
