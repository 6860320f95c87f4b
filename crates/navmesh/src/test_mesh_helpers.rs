//! Test mesh creation helpers
//!
//! Tiles are flat (y = 0) grids of square cells built with [`TileBuilder`].

use glam::Vec3;

use crate::{NavMesh, PolyFlags, TileBuilder, TileData};
use nav_common::Result;

fn cell(x0: f32, z0: f32, size: f32) -> [Vec3; 4] {
    [
        Vec3::new(x0, 0.0, z0),
        Vec3::new(x0, 0.0, z0 + size),
        Vec3::new(x0 + size, 0.0, z0 + size),
        Vec3::new(x0 + size, 0.0, z0),
    ]
}

/// Tile (x, y) of edge `tile_size` covered by `n` x `n` walkable cells
pub fn grid_tile(x: i32, y: i32, tile_size: f32, n: usize) -> Result<TileData> {
    grid_tile_builder(x, y, tile_size, n)?.build()
}

pub fn grid_tile_builder(x: i32, y: i32, tile_size: f32, n: usize) -> Result<TileBuilder> {
    let bmin = Vec3::new(x as f32 * tile_size, 0.0, y as f32 * tile_size);
    let bmax = bmin + Vec3::new(tile_size, 0.0, tile_size);
    let mut builder = TileBuilder::new(x, y, bmin, bmax);
    let step = tile_size / n as f32;
    for row in 0..n {
        for col in 0..n {
            let quad = cell(bmin.x + col as f32 * step, bmin.z + row as f32 * step, step);
            builder.add_polygon(&quad, 0, PolyFlags::WALK)?;
        }
    }
    Ok(builder)
}

pub fn grid_tile_bytes(x: i32, y: i32, tile_size: f32, n: usize) -> Vec<u8> {
    grid_tile(x, y, tile_size, n)
        .and_then(|t| t.to_bytes())
        .expect("grid tile encodes")
}

/// One tile of `n` x `n` unit cells at the origin
pub fn single_tile_mesh(n: usize) -> Result<NavMesh> {
    let size = n as f32;
    let mut mesh = NavMesh::init(size, 4, 8)?;
    mesh.add_tile(&grid_tile_bytes(0, 0, size, n))?;
    Ok(mesh)
}

/// `tiles_x` x `tiles_y` tiles of `n` x `n` cells each
pub fn grid_mesh(tiles_x: i32, tiles_y: i32, tile_size: f32, n: usize) -> Result<NavMesh> {
    let mut mesh = NavMesh::init(tile_size, 6, 8)?;
    for y in 0..tiles_y {
        for x in 0..tiles_x {
            mesh.add_tile(&grid_tile_bytes(x, y, tile_size, n))?;
        }
    }
    Ok(mesh)
}

/// A 10 x 4 tile holding two 4 x 4 squares separated by a 2 unit gap
pub fn islands_builder() -> TileBuilder {
    let mut builder = TileBuilder::new(0, 0, Vec3::ZERO, Vec3::new(10.0, 0.0, 4.0));
    for x0 in [0.0, 6.0] {
        builder
            .add_polygon(&cell(x0, 0.0, 4.0), 0, PolyFlags::WALK)
            .expect("square polygon");
    }
    builder
}

pub fn islands_mesh() -> Result<NavMesh> {
    let mut mesh = NavMesh::init(10.0, 4, 8)?;
    mesh.add_tile(&islands_builder().to_bytes()?)?;
    Ok(mesh)
}

/// The two islands joined by an off-mesh connection from (3.5, 2) to (6.5, 2)
pub fn off_mesh_mesh(bidirectional: bool) -> Result<NavMesh> {
    let mut builder = islands_builder();
    builder.add_off_mesh_connection(
        Vec3::new(3.5, 0.0, 2.0),
        Vec3::new(6.5, 0.0, 2.0),
        0.5,
        bidirectional,
        0,
        PolyFlags::JUMP,
        42,
    )?;
    let mut mesh = NavMesh::init(10.0, 4, 8)?;
    mesh.add_tile(&builder.to_bytes()?)?;
    Ok(mesh)
}
