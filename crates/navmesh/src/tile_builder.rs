//! Assembling tile payloads from polygons
//!
//! The builder takes world-space polygons for one tile, works out which
//! edges are shared, marks edges on the tile border as portals and emits a
//! [`TileData`] ready to be serialized and handed to [`NavMesh::add_tile`].
//!
//! [`NavMesh::add_tile`]: crate::NavMesh::add_tile

use std::collections::HashMap;

use glam::Vec3;

use super::binary_format::TileData;
use super::nav_mesh::{OffMeshConnection, Poly, TileHeader, EXT_LINK, OFFMESH_CON_BIDIR};
use super::{PolyFlags, PolyType, MAX_VERTS_PER_POLY};
use nav_common::{tri_area_2d, vequal, BoundingBox, Error, Result};

/// Distance under which a vertex counts as lying on the tile border
const BORDER_EPSILON: f32 = 1e-4;

#[derive(Debug, Clone)]
struct PolyDesc {
    verts: Vec<u16>,
    area: u8,
    flags: PolyFlags,
}

#[derive(Debug, Clone)]
struct OffMeshDesc {
    start: Vec3,
    end: Vec3,
    radius: f32,
    bidirectional: bool,
    area: u8,
    flags: PolyFlags,
    user_id: u32,
}

/// Builds the payload of a single tile
#[derive(Debug, Clone)]
pub struct TileBuilder {
    x: i32,
    y: i32,
    layer: i32,
    bmin: Vec3,
    bmax: Vec3,
    walkable_height: f32,
    walkable_radius: f32,
    walkable_climb: f32,
    verts: Vec<Vec3>,
    polys: Vec<PolyDesc>,
    off_mesh: Vec<OffMeshDesc>,
}

impl TileBuilder {
    /// Starts a tile at grid coordinate `(x, y)` covering `bmin..bmax`
    pub fn new(x: i32, y: i32, bmin: Vec3, bmax: Vec3) -> Self {
        Self {
            x,
            y,
            layer: 0,
            bmin,
            bmax,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            verts: Vec::new(),
            polys: Vec::new(),
            off_mesh: Vec::new(),
        }
    }

    /// Sets the agent dimensions recorded in the tile header
    pub fn with_walkable(mut self, height: f32, radius: f32, climb: f32) -> Self {
        self.walkable_height = height;
        self.walkable_radius = radius;
        self.walkable_climb = climb;
        self
    }

    pub fn with_layer(mut self, layer: i32) -> Self {
        self.layer = layer;
        self
    }

    /// Adds a vertex, reusing an existing one at the same position
    pub fn add_vertex(&mut self, v: Vec3) -> Result<u16> {
        if let Some(i) = self.verts.iter().position(|p| vequal(p, &v)) {
            return Ok(i as u16);
        }
        if self.verts.len() >= u16::MAX as usize {
            return Err(Error::CapacityExceeded("tile vertex limit reached".to_string()));
        }
        self.verts.push(v);
        Ok((self.verts.len() - 1) as u16)
    }

    /// Adds a convex polygon given by world-space vertices.
    ///
    /// Vertices may come in either winding; they are stored clockwise as
    /// seen from above. Returns the polygon index.
    pub fn add_polygon(&mut self, verts: &[Vec3], area: u8, flags: PolyFlags) -> Result<usize> {
        let indices = verts
            .iter()
            .map(|v| self.add_vertex(*v))
            .collect::<Result<Vec<_>>>()?;
        self.add_polygon_indices(&indices, area, flags)
    }

    /// Adds a convex polygon over previously added vertices
    pub fn add_polygon_indices(
        &mut self,
        indices: &[u16],
        area: u8,
        flags: PolyFlags,
    ) -> Result<usize> {
        if indices.len() < 3 || indices.len() > MAX_VERTS_PER_POLY {
            return Err(Error::InvalidParam(format!(
                "polygon needs 3..={MAX_VERTS_PER_POLY} vertices, got {}",
                indices.len()
            )));
        }
        if let Some(&i) = indices.iter().find(|&&i| i as usize >= self.verts.len()) {
            return Err(Error::InvalidParam(format!("unknown vertex {i}")));
        }
        if area >= 64 {
            return Err(Error::InvalidParam(format!("area {area} does not fit 6 bits")));
        }
        let mut verts = indices.to_vec();
        let points: Vec<Vec3> = verts.iter().map(|&i| self.verts[i as usize]).collect();
        let signed = signed_area_2d(&points);
        if signed.abs() <= f32::EPSILON {
            return Err(Error::InvalidParam("degenerate polygon".to_string()));
        }
        if signed < 0.0 {
            verts.reverse();
        }
        self.polys.push(PolyDesc { verts, area, flags });
        Ok(self.polys.len() - 1)
    }

    /// Adds an off-mesh connection between two points of this tile
    #[allow(clippy::too_many_arguments)]
    pub fn add_off_mesh_connection(
        &mut self,
        start: Vec3,
        end: Vec3,
        radius: f32,
        bidirectional: bool,
        area: u8,
        flags: PolyFlags,
        user_id: u32,
    ) -> Result<()> {
        if !(radius > 0.0) {
            return Err(Error::InvalidParam(format!("radius must be positive, got {radius}")));
        }
        if area >= 64 {
            return Err(Error::InvalidParam(format!("area {area} does not fit 6 bits")));
        }
        self.off_mesh.push(OffMeshDesc {
            start,
            end,
            radius,
            bidirectional,
            area,
            flags,
            user_id,
        });
        Ok(())
    }

    fn border_side(&self, a: &Vec3, b: &Vec3) -> Option<u8> {
        let on = |pa: f32, pb: f32, line: f32| {
            (pa - line).abs() < BORDER_EPSILON && (pb - line).abs() < BORDER_EPSILON
        };
        if on(a.x, b.x, self.bmax.x) {
            Some(0)
        } else if on(a.z, b.z, self.bmax.z) {
            Some(2)
        } else if on(a.x, b.x, self.bmin.x) {
            Some(4)
        } else if on(a.z, b.z, self.bmin.z) {
            Some(6)
        } else {
            None
        }
    }

    /// Produces the tile contents
    pub fn build(&self) -> Result<TileData> {
        if self.polys.is_empty() {
            return Err(Error::InvalidParam("tile has no polygons".to_string()));
        }

        // Directed edge -> owning polygon
        let mut edges: HashMap<(u16, u16), usize> = HashMap::new();
        for (pi, desc) in self.polys.iter().enumerate() {
            let n = desc.verts.len();
            for j in 0..n {
                edges.insert((desc.verts[j], desc.verts[(j + 1) % n]), pi);
            }
        }

        let mut polys = Vec::with_capacity(self.polys.len() + self.off_mesh.len());
        for desc in &self.polys {
            let n = desc.verts.len();
            let mut poly = Poly {
                flags: desc.flags,
                vert_count: n as u8,
                area: desc.area,
                poly_type: PolyType::Ground,
                ..Default::default()
            };
            for j in 0..n {
                let (va, vb) = (desc.verts[j], desc.verts[(j + 1) % n]);
                poly.verts[j] = va;
                poly.neis[j] = if let Some(&other) = edges.get(&(vb, va)) {
                    (other + 1) as u16
                } else if let Some(side) =
                    self.border_side(&self.verts[va as usize], &self.verts[vb as usize])
                {
                    EXT_LINK | u16::from(side)
                } else {
                    0
                };
            }
            polys.push(poly);
        }

        let mut verts = self.verts.clone();
        let mut bounds = BoundingBox::new(self.bmin, self.bmax);
        let off_mesh_base = polys.len();
        let mut off_mesh_connections = Vec::with_capacity(self.off_mesh.len());
        for desc in &self.off_mesh {
            let v0 = verts.len() as u16;
            verts.push(desc.start);
            verts.push(desc.end);
            bounds = bounds.merge(desc.start).merge(desc.end);

            let mut poly = Poly {
                flags: desc.flags,
                vert_count: 2,
                area: desc.area,
                poly_type: PolyType::OffMeshConnection,
                ..Default::default()
            };
            poly.verts[0] = v0;
            poly.verts[1] = v0 + 1;
            off_mesh_connections.push(OffMeshConnection {
                start: desc.start,
                end: desc.end,
                radius: desc.radius,
                poly: polys.len() as u16,
                flags: if desc.bidirectional { OFFMESH_CON_BIDIR } else { 0 },
                side: 0xff,
                user_id: desc.user_id,
            });
            polys.push(poly);
        }
        if verts.len() > u16::MAX as usize {
            return Err(Error::CapacityExceeded("tile vertex limit reached".to_string()));
        }

        Ok(TileData {
            header: TileHeader {
                x: self.x,
                y: self.y,
                layer: self.layer,
                user_id: 0,
                off_mesh_base: off_mesh_base as i32,
                walkable_height: self.walkable_height,
                walkable_radius: self.walkable_radius,
                walkable_climb: self.walkable_climb,
                bmin: bounds.min,
                bmax: bounds.max,
                bv_quant_factor: 0.0,
            },
            verts,
            polys,
            off_mesh_connections,
            ..Default::default()
        })
    }

    /// Builds and serializes the tile
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.build()?.to_bytes()
    }
}

/// Twice the signed area of a polygon fan; positive for clockwise winding
fn signed_area_2d(points: &[Vec3]) -> f32 {
    (2..points.len())
        .map(|i| tri_area_2d(&points[0], &points[i - 1], &points[i]))
        .sum()
}
