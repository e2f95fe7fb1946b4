//! Scene handle consumed by `process`: a set of shapes, each with an id and a visibility mask

use crate::primitives::{Curves, Mesh, PrimitiveKind};

pub type ShapeId = u32;

#[derive(Debug, Clone)]
pub enum Geometry {
    Mesh(Mesh),
    Curves(Curves),
}

impl Geometry {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Geometry::Mesh(_) => PrimitiveKind::Triangle,
            Geometry::Curves(_) => PrimitiveKind::Curve,
        }
    }

    pub fn primitive_count(&self) -> usize {
        match self {
            Geometry::Mesh(mesh) => mesh.tri_count(),
            Geometry::Curves(curves) => curves.segment_count(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Shape {
    pub id: ShapeId,
    /// Rays only consider shapes whose mask shares a bit with the ray mask
    pub mask: u32,
    pub geometry: Geometry,
}

/// Every mutation bumps `version`, which is how engines notice they need to process again
#[derive(Debug, Clone, Default)]
pub struct World {
    shapes: Vec<Shape>,
    next_id: ShapeId,
    version: u64,
}

impl World {
    pub fn new() -> World {
        World::default()
    }

    pub fn attach(&mut self, geometry: Geometry) -> ShapeId {
        self.attach_with_mask(geometry, u32::MAX)
    }

    pub fn attach_with_mask(&mut self, geometry: Geometry, mask: u32) -> ShapeId {
        let id = self.next_id;
        self.next_id += 1;
        self.shapes.push(Shape { id, mask, geometry });
        self.version += 1;
        id
    }

    pub fn attach_mesh(&mut self, mesh: Mesh) -> ShapeId {
        self.attach(Geometry::Mesh(mesh))
    }

    pub fn attach_curves(&mut self, curves: Curves) -> ShapeId {
        self.attach(Geometry::Curves(curves))
    }

    pub fn detach(&mut self, id: ShapeId) -> Option<Shape> {
        let position = self.shapes.iter().position(|s| s.id == id)?;
        self.version += 1;
        Some(self.shapes.remove(position))
    }

    pub fn detach_all(&mut self) {
        self.shapes.clear();
        self.version += 1;
    }

    pub fn set_mask(&mut self, id: ShapeId, mask: u32) -> bool {
        match self.shapes.iter_mut().find(|s| s.id == id) {
            Some(shape) => {
                shape.mask = mask;
                self.version += 1;
                true
            }
            None => false,
        }
    }

    pub fn shape(&self, id: ShapeId) -> Option<&Shape> {
        self.shapes.iter().find(|s| s.id == id)
    }

    /// Shapes in attachment order
    pub fn shapes(&self) -> impl Iterator<Item = &Shape> {
        self.shapes.iter()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn primitive_count(&self, kind: PrimitiveKind) -> usize {
        self.shapes
            .iter()
            .filter(|s| s.geometry.kind() == kind)
            .map(|s| s.geometry.primitive_count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        PrimitiveKind::ALL.iter().all(|&kind| self.primitive_count(kind) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Vec3, Vec3u};

    fn triangle() -> Mesh {
        Mesh::new(
            vec![Vec3(0.0, 0.0, 0.0), Vec3(1.0, 0.0, 0.0), Vec3(0.0, 1.0, 0.0)],
            vec![Vec3u(0, 1, 2)],
        )
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut world = World::new();
        let a = world.attach_mesh(triangle());
        world.detach(a);
        let b = world.attach_mesh(triangle());
        assert_ne!(a, b);
        assert_eq!(world.primitive_count(PrimitiveKind::Triangle), 1);
    }

    #[test]
    fn test_mutations_bump_version() {
        let mut world = World::new();
        let v0 = world.version();
        let id = world.attach_mesh(triangle());
        let v1 = world.version();
        assert!(v1 > v0);
        assert!(world.set_mask(id, 0b10));
        assert!(world.version() > v1);
        assert!(!world.set_mask(id + 100, 0));
        world.detach_all();
        assert!(world.is_empty());
    }
}
