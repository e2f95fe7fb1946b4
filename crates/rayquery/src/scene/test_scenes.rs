//! Procedural worlds and ray batches used by the tests and the `rayquery` CLI.
//!
//! Every world fits inside [-1, 1]^3; random content is seeded so runs are reproducible.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    geometry::{Vec3, Vec3u},
    primitives::{Curves, Mesh},
    ray::Ray,
    world::World,
};

fn random_point(rng: &mut StdRng, extent: f32) -> Vec3 {
    Vec3(
        rng.random_range(-extent..extent),
        rng.random_range(-extent..extent),
        rng.random_range(-extent..extent),
    )
}

/// Counterclockwise triangle in the z=0 plane facing +z
pub fn single_triangle() -> World {
    let mut world = World::new();
    world.attach_mesh(Mesh::new(
        vec![Vec3(-1.0, -1.0, 0.0), Vec3(1.0, -1.0, 0.0), Vec3(0.0, 1.0, 0.0)],
        vec![Vec3u(0, 1, 2)],
    ));
    world
}

/// `n` x `n` quads tiling [-1, 1]^2 at z=0, as one mesh
pub fn triangle_grid(n: u32) -> World {
    let n = n.max(1);
    let step = 2.0 / n as f32;

    let mut vertices = Vec::with_capacity(((n + 1) * (n + 1)) as usize);
    for j in 0..=n {
        for i in 0..=n {
            vertices.push(Vec3(-1.0 + i as f32 * step, -1.0 + j as f32 * step, 0.0));
        }
    }

    let mut tris = Vec::with_capacity((2 * n * n) as usize);
    let row = n + 1;
    for j in 0..n {
        for i in 0..n {
            let a = j * row + i;
            tris.push(Vec3u(a, a + 1, a + row + 1));
            tris.push(Vec3u(a, a + row + 1, a + row));
        }
    }

    let mut world = World::new();
    world.attach_mesh(Mesh::new(vertices, tris));
    world
}

/// `count` small triangles scattered through the unit cube, one shape per 64 triangles
pub fn random_triangles(count: usize, seed: u64) -> World {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut world = World::new();

    let mut remaining = count;
    while remaining > 0 {
        let batch = remaining.min(64);
        let mut vertices = Vec::with_capacity(batch * 3);
        let mut tris = Vec::with_capacity(batch);
        for i in 0..batch as u32 {
            let center = random_point(&mut rng, 0.9);
            vertices.push(center + random_point(&mut rng, 0.1));
            vertices.push(center + random_point(&mut rng, 0.1));
            vertices.push(center + random_point(&mut rng, 0.1));
            tris.push(Vec3u(3 * i, 3 * i + 1, 3 * i + 2));
        }
        world.attach_mesh(Mesh::new(vertices, tris));
        remaining -= batch;
    }
    world
}

/// Wavy vertical strands rising from the z=-1 plane
pub fn hair(strands: usize, seed: u64) -> World {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut curves = Curves::default();

    for _ in 0..strands {
        let root = Vec3(rng.random_range(-0.9..0.9), rng.random_range(-0.9..0.9), -1.0);
        let phase: f32 = rng.random_range(0.0..std::f32::consts::TAU);
        let points: Vec<Vec3> = (0..8)
            .map(|k| {
                let h = k as f32 / 7.0;
                root + Vec3(0.05 * (phase + 6.0 * h).sin(), 0.05 * (phase + 6.0 * h).cos(), 1.5 * h)
            })
            .collect();
        curves.push_strand(&points, 0.01);
    }

    let mut world = World::new();
    world.attach_curves(curves);
    world
}

/// Hair growing out of a triangle grid
pub fn mixed(seed: u64) -> World {
    let mut world = triangle_grid(4);
    if let Some(shape) = hair(64, seed).shapes().next() {
        world.attach(shape.geometry.clone());
    }
    world
}

/// Rays starting outside the unit cube and aimed at random points inside it
pub fn random_rays(count: usize, seed: u64) -> Vec<Ray> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let target = random_point(&mut rng, 1.0);
            let origin = Vec3(rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0), 3.0);
            Ray::new(origin, Vec3::normalized(target - origin))
        })
        .collect()
}

/// Rays lined up with the vertices and edges of `triangle_grid(n)`: straight down through every
/// vertex and edge midpoint (with both signs of zero in the direction), plus slanted rays whose
/// origins sit on the grid's vertical planes.
pub fn grid_aligned_rays(n: u32) -> Vec<Ray> {
    let n = n.max(1);
    let step = 2.0 / n as f32;
    let coord = |i: u32| -1.0 + i as f32 * step;
    let down = Vec3(0.0, 0.0, -1.0);
    let down_negative_zero = Vec3(-0.0, -0.0, -1.0);
    let slant = Vec3::normalized(Vec3(0.3, 0.2, -1.0));

    let mut rays = Vec::new();
    for j in 0..=n {
        for i in 0..=n {
            let vertex = Vec3(coord(i), coord(j), 1.0);
            rays.push(Ray::new(vertex, down));
            rays.push(Ray::new(vertex, down_negative_zero));
            rays.push(Ray::new(vertex, slant));
            rays.push(Ray::new(vertex + Vec3(step * 0.5, 0.0, 0.0), down));
            rays.push(Ray::new(vertex + Vec3(0.0, step * 0.5, 0.0), down_negative_zero));
            rays.push(Ray::new(vertex + Vec3(step * 0.5, step * 0.5, 0.0), down));
        }
    }
    rays
}

pub struct TestScene {
    pub name: &'static str,
    pub world_func: fn() -> World,
}

pub const fn all_test_scenes() -> &'static [TestScene] {
    &[
        TestScene {
            name: "triangle",
            world_func: single_triangle,
        },
        TestScene {
            name: "grid",
            world_func: || triangle_grid(32),
        },
        TestScene {
            name: "random",
            world_func: || random_triangles(10_000, 0),
        },
        TestScene {
            name: "hair",
            world_func: || hair(256, 0),
        },
        TestScene {
            name: "mixed",
            world_func: || mixed(0),
        },
    ]
}

pub fn find_test_scene(name: &str) -> Option<&'static TestScene> {
    all_test_scenes().iter().find(|scene| scene.name == name)
}
