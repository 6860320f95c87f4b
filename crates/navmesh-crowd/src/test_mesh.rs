//! Flat test meshes for crowd tests

use glam::Vec3;

use nav_common::Result;
use navmesh::{NavMesh, PolyFlags, TileBuilder};

fn cell(x0: f32, z0: f32, size: f32) -> [Vec3; 4] {
    [
        Vec3::new(x0, 0.0, z0),
        Vec3::new(x0, 0.0, z0 + size),
        Vec3::new(x0 + size, 0.0, z0 + size),
        Vec3::new(x0 + size, 0.0, z0),
    ]
}

/// One tile of `n` x `n` unit cells covering `[0, n]` on x and z
pub fn grid_mesh(n: usize) -> Result<NavMesh> {
    let size = n as f32;
    let mut builder = TileBuilder::new(0, 0, Vec3::ZERO, Vec3::new(size, 0.0, size));
    for row in 0..n {
        for col in 0..n {
            builder.add_polygon(&cell(col as f32, row as f32, 1.0), 0, PolyFlags::WALK)?;
        }
    }
    let mut mesh = NavMesh::init(size, 4, 8)?;
    mesh.add_tile(&builder.to_bytes()?)?;
    Ok(mesh)
}

/// A row of `n` unit cells along +x with a one cell wide corridor
pub fn corridor_mesh(n: usize) -> Result<NavMesh> {
    let size = n as f32;
    let mut builder = TileBuilder::new(0, 0, Vec3::ZERO, Vec3::new(size, 0.0, size));
    for col in 0..n {
        builder.add_polygon(&cell(col as f32, 0.0, 1.0), 0, PolyFlags::WALK)?;
    }
    let mut mesh = NavMesh::init(size, 4, 8)?;
    mesh.add_tile(&builder.to_bytes()?)?;
    Ok(mesh)
}

/// Two 4 x 4 squares with a gap, joined by a one-way jump from
/// (3.5, 2) to (6.5, 2)
pub fn jump_mesh() -> Result<NavMesh> {
    let mut builder = TileBuilder::new(0, 0, Vec3::ZERO, Vec3::new(10.0, 0.0, 4.0));
    for x0 in [0.0, 6.0] {
        builder.add_polygon(&cell(x0, 0.0, 4.0), 0, PolyFlags::WALK)?;
    }
    builder.add_off_mesh_connection(
        Vec3::new(3.5, 0.0, 2.0),
        Vec3::new(6.5, 0.0, 2.0),
        0.5,
        false,
        0,
        PolyFlags::JUMP,
        7,
    )?;
    let mut mesh = NavMesh::init(10.0, 4, 8)?;
    mesh.add_tile(&builder.to_bytes()?)?;
    Ok(mesh)
}
