use crate::geometry::Vec3;

/// Set of linear curve segments with a radius per control point.
/// Each segment is intersected as a capsule whose radius is the mean of its endpoint radii.
#[derive(Debug, Clone, Default)]
pub struct Curves {
    pub vertices: Vec<Vec3>,
    pub radii: Vec<f32>,
    pub segments: Vec<[u32; 2]>,
}

impl Curves {
    pub fn new(vertices: Vec<Vec3>, radii: Vec<f32>, segments: Vec<[u32; 2]>) -> Curves {
        Curves { vertices, radii, segments }
    }

    /// Appends a polyline strand through `points` with constant radius
    pub fn push_strand(&mut self, points: &[Vec3], radius: f32) {
        let first = self.vertices.len() as u32;
        self.vertices.extend_from_slice(points);
        self.radii.extend(std::iter::repeat(radius).take(points.len()));
        for i in 1..points.len() as u32 {
            self.segments.push([first + i - 1, first + i]);
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Endpoints and radius of a segment, or `None` if it references a missing vertex
    pub fn segment(&self, segment_idx: usize) -> Option<(Vec3, Vec3, f32)> {
        let [a, b] = *self.segments.get(segment_idx)?;
        let p0 = *self.vertices.get(a as usize)?;
        let p1 = *self.vertices.get(b as usize)?;
        let r0 = *self.radii.get(a as usize)?;
        let r1 = *self.radii.get(b as usize)?;
        Some((p0, p1, 0.5 * (r0 + r1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strand_segments() {
        let mut curves = Curves::default();
        curves.push_strand(&[Vec3(0.0, 0.0, 0.0), Vec3(0.0, 1.0, 0.0), Vec3(0.0, 2.0, 0.0)], 0.1);
        curves.push_strand(&[Vec3(1.0, 0.0, 0.0), Vec3(1.0, 1.0, 0.0)], 0.2);
        assert_eq!(curves.segments, vec![[0, 1], [1, 2], [3, 4]]);
        let (p0, p1, r) = curves.segment(2).unwrap();
        assert_eq!(p0, Vec3(1.0, 0.0, 0.0));
        assert_eq!(p1, Vec3(1.0, 1.0, 0.0));
        assert!((r - 0.2).abs() < 1e-6);
    }
}
