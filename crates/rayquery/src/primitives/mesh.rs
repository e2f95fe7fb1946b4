use crate::geometry::{Vec3, Vec3u};

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vec3>,
    pub tris: Vec<Vec3u>,
}

impl Mesh {
    pub fn new(vertices: Vec<Vec3>, tris: Vec<Vec3u>) -> Mesh {
        Mesh { vertices, tris }
    }

    pub fn tri_count(&self) -> usize {
        self.tris.len()
    }

    /// Vertex positions of a triangle, or `None` if it references a missing vertex
    pub fn tri_vertices(&self, tri_idx: usize) -> Option<(Vec3, Vec3, Vec3)> {
        let tri = self.tris.get(tri_idx)?;
        let p0 = *self.vertices.get(tri.0 as usize)?;
        let p1 = *self.vertices.get(tri.1 as usize)?;
        let p2 = *self.vertices.get(tri.2 as usize)?;
        Some((p0, p1, p2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tri_vertices() {
        let mesh = Mesh::new(
            vec![Vec3(0.0, 0.0, 0.0), Vec3(1.0, 0.0, 0.0), Vec3(1.0, 1.0, 0.0)],
            vec![Vec3u(2, 0, 1)],
        );
        assert_eq!(mesh.tri_count(), 1);
        assert_eq!(
            mesh.tri_vertices(0),
            Some((Vec3(1.0, 1.0, 0.0), Vec3(0.0, 0.0, 0.0), Vec3(1.0, 0.0, 0.0)))
        );
        assert!(mesh.tri_vertices(1).is_none());
    }

    #[test]
    fn test_missing_vertex() {
        let mesh = Mesh::new(vec![Vec3::zero()], vec![Vec3u(0, 1, 2)]);
        assert!(mesh.tri_vertices(0).is_none());
    }
}
