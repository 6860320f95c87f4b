//! Navigation mesh implementation
//!
//! The navigation mesh is a set of polygon tiles laid out on a 2D grid. Each
//! loaded tile occupies one slot; polygons are addressed through
//! [`PolyRef`] values that encode the slot, the polygon index and the
//! slot's current salt. Tiles are linked to their four grid neighbours when
//! loaded, so searches can cross tile borders.

use std::collections::HashMap;

use glam::Vec3;
use log::debug;

use super::binary_format::TileData;
use super::poly_ref::{PolyRef, RefLayout};
use super::{PolyFlags, PolyType, QueryFilter, MAX_VERTS_PER_POLY};
use nav_common::{
    closest_height_point_triangle, dist_pt_seg_sqr_2d, distance_pt_poly_edges_sqr,
    point_in_polygon_2d, sqr, BoundingBox, Error, Result,
};

/// Neighbour flag marking an edge that continues in an adjacent tile
pub const EXT_LINK: u16 = 0x8000;

/// Side value of links that stay inside their tile
pub const LINK_SIDE_INTERNAL: u8 = 0xff;

/// Edge value of links that lead onto an off-mesh connection
pub const LINK_EDGE_OFFMESH: u8 = 0xff;

/// Off-mesh connection can be traversed in both directions
pub const OFFMESH_CON_BIDIR: u8 = 1;

/// Horizontal tolerance when matching portal edges across tiles
const PORTAL_EPSILON: f32 = 0.01;

/// Link between two polygons
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Polygon the link leads to
    pub reference: PolyRef,
    /// Next link of the same polygon
    pub next: Option<u32>,
    /// Edge of the owning polygon the link crosses
    pub edge: u8,
    /// Tile side for cross-tile links, [`LINK_SIDE_INTERNAL`] otherwise
    pub side: u8,
    /// Start of the usable sub-edge, 0..=255 along the edge
    pub bmin: u8,
    /// End of the usable sub-edge, 0..=255 along the edge
    pub bmax: u8,
}

/// Polygon of a tile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Poly {
    /// Head of the polygon's link chain
    pub first_link: Option<u32>,
    /// Vertex indices into the tile vertex array
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Neighbour encoding per edge: 0 none, `n` internal poly `n - 1`,
    /// `EXT_LINK | side` for a tile portal
    pub neis: [u16; MAX_VERTS_PER_POLY],
    pub flags: PolyFlags,
    pub vert_count: u8,
    /// Area id (low 6 bits in the payload)
    pub area: u8,
    pub poly_type: PolyType,
}

impl Poly {
    /// Vertex indices actually used by the polygon
    pub fn vert_indices(&self) -> &[u16] {
        &self.verts[..self.vert_count as usize]
    }

    pub fn is_off_mesh(&self) -> bool {
        self.poly_type == PolyType::OffMeshConnection
    }
}

/// Detail sub-mesh of one polygon
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PolyDetail {
    pub vert_base: u32,
    pub tri_base: u32,
    pub vert_count: u8,
    pub tri_count: u8,
}

/// Point-to-point connection that is not part of the walkable surface
#[derive(Debug, Clone, PartialEq)]
pub struct OffMeshConnection {
    pub start: Vec3,
    pub end: Vec3,
    /// Snap radius at both endpoints
    pub radius: f32,
    /// Index of the two-vertex polygon representing the connection
    pub poly: u16,
    pub flags: u8,
    pub side: u8,
    pub user_id: u32,
}

impl OffMeshConnection {
    pub fn is_bidirectional(&self) -> bool {
        self.flags & OFFMESH_CON_BIDIR != 0
    }
}

/// Header of a tile payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileHeader {
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub user_id: u32,
    pub off_mesh_base: i32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub bv_quant_factor: f32,
}

/// A loaded tile
#[derive(Debug, Clone)]
pub struct MeshTile {
    /// Salt of the slot when the tile was loaded
    pub salt: u32,
    pub header: TileHeader,
    pub verts: Vec<Vec3>,
    pub polys: Vec<Poly>,
    pub links: Vec<Link>,
    free_links: Vec<u32>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<Vec3>,
    pub detail_tris: Vec<[u8; 4]>,
    pub off_mesh_connections: Vec<OffMeshConnection>,
    payload: Vec<u8>,
}

impl MeshTile {
    fn from_data(data: TileData, payload: Vec<u8>, salt: u32) -> Self {
        let mut polys = data.polys;
        for poly in &mut polys {
            poly.first_link = None;
        }
        Self {
            salt,
            header: data.header,
            verts: data.verts,
            polys,
            links: Vec::new(),
            free_links: Vec::new(),
            detail_meshes: data.detail_meshes,
            detail_verts: data.detail_verts,
            detail_tris: data.detail_tris,
            off_mesh_connections: data.off_mesh_connections,
            payload,
        }
    }

    /// The serialized payload the tile was loaded from
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Positions of the polygon's vertices
    pub fn poly_verts(&self, poly: &Poly) -> Vec<Vec3> {
        poly.vert_indices()
            .iter()
            .map(|&v| self.verts[v as usize])
            .collect()
    }

    pub fn poly_bounds(&self, poly: &Poly) -> BoundingBox {
        BoundingBox::from_points(poly.vert_indices().iter().map(|&v| &self.verts[v as usize]))
    }

    /// Iterates the links of a polygon in chain order
    pub fn links_of(&self, poly: &Poly) -> impl Iterator<Item = &Link> + '_ {
        let first = poly.first_link.and_then(|i| self.links.get(i as usize));
        std::iter::successors(first, move |link| {
            link.next.and_then(|i| self.links.get(i as usize))
        })
    }

    fn add_link(&mut self, poly_idx: usize, mut link: Link) {
        link.next = self.polys[poly_idx].first_link;
        let idx = match self.free_links.pop() {
            Some(idx) => {
                self.links[idx as usize] = link;
                idx
            }
            None => {
                self.links.push(link);
                (self.links.len() - 1) as u32
            }
        };
        self.polys[poly_idx].first_link = Some(idx);
    }

    fn unlink_where(&mut self, mut pred: impl FnMut(&Link) -> bool) {
        for pi in 0..self.polys.len() {
            let mut prev: Option<u32> = None;
            let mut cur = self.polys[pi].first_link;
            while let Some(li) = cur {
                let next = self.links[li as usize].next;
                if pred(&self.links[li as usize]) {
                    match prev {
                        Some(p) => self.links[p as usize].next = next,
                        None => self.polys[pi].first_link = next,
                    }
                    self.links[li as usize].next = None;
                    self.free_links.push(li);
                } else {
                    prev = Some(li);
                }
                cur = next;
            }
        }
    }

    /// Triangles covering a polygon, from the detail mesh when present
    pub fn poly_triangles(&self, poly_idx: usize) -> Vec<[Vec3; 3]> {
        let poly = &self.polys[poly_idx];
        let nv = poly.vert_count as usize;
        if let Some(detail) = self.detail_meshes.get(poly_idx) {
            if detail.tri_count > 0 {
                let vertex = |i: u8| -> Vec3 {
                    let i = i as usize;
                    if i < nv {
                        self.verts[poly.verts[i] as usize]
                    } else {
                        self.detail_verts[detail.vert_base as usize + (i - nv)]
                    }
                };
                let base = detail.tri_base as usize;
                return self.detail_tris[base..base + detail.tri_count as usize]
                    .iter()
                    .map(|t| [vertex(t[0]), vertex(t[1]), vertex(t[2])])
                    .collect();
            }
        }
        let verts = self.poly_verts(poly);
        (2..verts.len())
            .map(|i| [verts[0], verts[i - 1], verts[i]])
            .collect()
    }

    /// Surface height of a polygon at `pos`, if `pos` lies over it
    pub fn poly_height(&self, poly_idx: usize, pos: &Vec3) -> Option<f32> {
        let poly = self.polys.get(poly_idx)?;
        if poly.is_off_mesh() {
            let v0 = self.verts[poly.verts[0] as usize];
            let v1 = self.verts[poly.verts[1] as usize];
            let (_, t) = dist_pt_seg_sqr_2d(pos, &v0, &v1);
            return Some(v0.y + (v1.y - v0.y) * t);
        }
        let verts = self.poly_verts(poly);
        if !point_in_polygon_2d(pos, &verts) {
            return None;
        }
        for [a, b, c] in self.poly_triangles(poly_idx) {
            if let Some(h) = closest_height_point_triangle(pos, &a, &b, &c) {
                return Some(h);
            }
        }
        // Point sits on an edge shared by two detail triangles and slipped
        // through both tests; take the height of the nearest boundary point.
        Some(self.closest_point_on_poly_boundary(poly_idx, pos).y)
    }

    /// Closest point on the polygon to `pos` and whether `pos` is over it
    pub fn closest_point_on_poly(&self, poly_idx: usize, pos: &Vec3) -> (Vec3, bool) {
        let Some(poly) = self.polys.get(poly_idx) else {
            return (*pos, false);
        };
        if poly.is_off_mesh() {
            let v0 = self.verts[poly.verts[0] as usize];
            let v1 = self.verts[poly.verts[1] as usize];
            let (_, t) = dist_pt_seg_sqr_2d(pos, &v0, &v1);
            return (v0.lerp(v1, t), false);
        }
        let verts = self.poly_verts(poly);
        if point_in_polygon_2d(pos, &verts) {
            if let Some(h) = self.poly_height(poly_idx, pos) {
                return (Vec3::new(pos.x, h, pos.z), true);
            }
        }
        (self.closest_point_on_poly_boundary(poly_idx, pos), false)
    }

    /// `pos` itself when inside the polygon on the XZ plane, otherwise the
    /// closest point on its boundary
    pub fn closest_point_on_poly_boundary(&self, poly_idx: usize, pos: &Vec3) -> Vec3 {
        let Some(poly) = self.polys.get(poly_idx) else {
            return *pos;
        };
        let verts = self.poly_verts(poly);
        let (inside, edges) = distance_pt_poly_edges_sqr(pos, &verts);
        if inside {
            return *pos;
        }
        let mut best = (f32::MAX, 0usize, 0.0f32);
        for (j, &(d, t)) in edges.iter().enumerate() {
            if d < best.0 {
                best = (d, j, t);
            }
        }
        let va = verts[best.1];
        let vb = verts[(best.1 + 1) % verts.len()];
        va.lerp(vb, best.2)
    }

    /// Closest point on the polygon and its squared distance to `center`.
    ///
    /// Over the polygon only the height difference beyond the walkable
    /// climb counts.
    pub fn nearest_point_score(&self, poly_idx: usize, center: &Vec3) -> (Vec3, f32) {
        let (closest, over) = self.closest_point_on_poly(poly_idx, center);
        let diff = *center - closest;
        let d = if over {
            let d = diff.y.abs() - self.header.walkable_climb;
            if d > 0.0 {
                d * d
            } else {
                0.0
            }
        } else {
            diff.length_squared()
        };
        (closest, d)
    }

    /// Nearest ground polygon of this tile within `center ± half_extents`
    fn find_nearest_poly_in_tile(
        &self,
        center: &Vec3,
        half_extents: &Vec3,
    ) -> Option<(usize, Vec3)> {
        let query = BoundingBox::from_half_extents(*center, *half_extents);
        let mut best: Option<(usize, Vec3, f32)> = None;
        for (i, poly) in self.polys.iter().enumerate() {
            if poly.is_off_mesh() || !self.poly_bounds(poly).intersects(&query) {
                continue;
            }
            let (closest, d) = self.nearest_point_score(i, center);
            if best.map_or(true, |(_, _, bd)| d < bd) {
                best = Some((i, closest, d));
            }
        }
        best.map(|(i, p, _)| (i, p))
    }
}

#[derive(Debug, Clone, Default)]
struct TileSlot {
    salt: u32,
    tile: Option<MeshTile>,
}

/// Creation parameters of a navigation mesh
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct NavMeshParams {
    /// World position of the corner of tile (0, 0)
    pub origin: Vec3,
    /// Tile extent along X
    pub tile_width: f32,
    /// Tile extent along Z
    pub tile_height: f32,
    /// Bits of a [`PolyRef`] spent on the tile slot
    pub tile_bits: u32,
    /// Bits of a [`PolyRef`] spent on the polygon index
    pub poly_bits: u32,
}

/// Tiled navigation mesh
#[derive(Debug)]
pub struct NavMesh {
    params: NavMeshParams,
    layout: RefLayout,
    slots: Vec<TileSlot>,
    free_slots: Vec<usize>,
    pos_lookup: HashMap<(i32, i32), usize>,
}

impl NavMesh {
    /// Creates an empty navigation mesh
    pub fn new(params: NavMeshParams) -> Result<Self> {
        if !(params.tile_width > 0.0 && params.tile_width.is_finite())
            || !(params.tile_height > 0.0 && params.tile_height.is_finite())
        {
            return Err(Error::InvalidParam(format!(
                "tile size must be positive, got {} x {}",
                params.tile_width, params.tile_height
            )));
        }
        if !params.origin.is_finite() {
            return Err(Error::InvalidParam("origin must be finite".to_string()));
        }
        let layout = RefLayout::new(params.tile_bits, params.poly_bits)?;
        debug!(
            "navmesh created: tile {}x{}, {} tile bits, {} poly bits, {} salt bits",
            params.tile_width,
            params.tile_height,
            layout.tile_bits(),
            layout.poly_bits(),
            layout.salt_bits()
        );
        Ok(Self {
            params,
            layout,
            slots: Vec::new(),
            free_slots: Vec::new(),
            pos_lookup: HashMap::new(),
        })
    }

    /// Creates a mesh of square tiles anchored at the world origin
    pub fn init(tile_size: f32, tile_bits: u32, poly_bits: u32) -> Result<Self> {
        Self::new(NavMeshParams {
            origin: Vec3::ZERO,
            tile_width: tile_size,
            tile_height: tile_size,
            tile_bits,
            poly_bits,
        })
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    pub fn layout(&self) -> RefLayout {
        self.layout
    }

    pub fn max_tiles(&self) -> u64 {
        self.layout.max_tiles()
    }

    /// Number of loaded tiles
    pub fn tile_count(&self) -> usize {
        self.pos_lookup.len()
    }

    /// Grid coordinate of the tile containing `pos`
    pub fn calc_tile_loc(&self, pos: &Vec3) -> (i32, i32) {
        let tx = ((pos.x - self.params.origin.x) / self.params.tile_width).floor() as i32;
        let ty = ((pos.z - self.params.origin.z) / self.params.tile_height).floor() as i32;
        (tx, ty)
    }

    /// Deserializes a tile payload and inserts it at its grid coordinate.
    ///
    /// Returns the reference of the tile's first polygon slot.
    pub fn add_tile(&mut self, data: &[u8]) -> Result<PolyRef> {
        let tile_data = TileData::from_bytes(data)?;
        tile_data.validate(self.layout.max_polys())?;

        let coord = (tile_data.header.x, tile_data.header.y);
        if self.pos_lookup.contains_key(&coord) {
            return Err(Error::AlreadyLoaded {
                x: coord.0,
                y: coord.1,
            });
        }

        let idx = self.allocate_slot()?;
        let salt = self.slots[idx].salt;
        self.slots[idx].tile = Some(MeshTile::from_data(tile_data, data.to_vec(), salt));
        self.pos_lookup.insert(coord, idx);

        self.connect_int_links(idx);
        self.connect_off_mesh_links(idx);

        for side in [0u8, 2, 4, 6] {
            let (dx, dy) = side_offset(side);
            if let Some(&nei) = self.pos_lookup.get(&(coord.0 + dx, coord.1 + dy)) {
                self.connect_ext_links(idx, nei, side);
                self.connect_ext_links(nei, idx, opposite_side(side));
            }
        }

        debug!(
            "tile ({}, {}) loaded into slot {} (salt {})",
            coord.0, coord.1, idx, salt
        );
        Ok(self.poly_ref_base(idx))
    }

    /// Adds a tile, first unloading whatever occupies its coordinate
    pub fn add_or_replace_tile(&mut self, data: &[u8]) -> Result<PolyRef> {
        let header = TileData::peek_header(data)?;
        self.remove_tile(header.x, header.y);
        self.add_tile(data)
    }

    /// Unloads the tile at `(x, y)`; returns whether one was loaded
    pub fn remove_tile(&mut self, x: i32, y: i32) -> bool {
        let Some(idx) = self.pos_lookup.remove(&(x, y)) else {
            return false;
        };

        let layout = self.layout;
        for side in [0u8, 2, 4, 6] {
            let (dx, dy) = side_offset(side);
            if let Some(&nei) = self.pos_lookup.get(&(x + dx, y + dy)) {
                if let Some(tile) = self.slots[nei].tile.as_mut() {
                    tile.unlink_where(|l| layout.decode(l.reference).tile as usize == idx);
                }
            }
        }

        let slot = &mut self.slots[idx];
        slot.tile = None;
        slot.salt = layout.next_salt(slot.salt);
        self.free_slots.push(idx);
        debug!("tile ({x}, {y}) removed from slot {idx}");
        true
    }

    fn allocate_slot(&mut self) -> Result<usize> {
        if let Some(idx) = self.free_slots.pop() {
            return Ok(idx);
        }
        if (self.slots.len() as u64) < self.layout.max_tiles() {
            self.slots.push(TileSlot {
                salt: 1,
                tile: None,
            });
            return Ok(self.slots.len() - 1);
        }
        Err(Error::CapacityExceeded(format!(
            "all {} tile slots are in use",
            self.layout.max_tiles()
        )))
    }

    /// Loaded tile at a grid coordinate
    pub fn tile_at(&self, x: i32, y: i32) -> Option<&MeshTile> {
        let idx = *self.pos_lookup.get(&(x, y))?;
        self.slots[idx].tile.as_ref()
    }

    /// Reference of polygon 0 of the tile at a grid coordinate
    pub fn tile_ref_at(&self, x: i32, y: i32) -> Option<PolyRef> {
        self.pos_lookup.get(&(x, y)).map(|&idx| self.poly_ref_base(idx))
    }

    /// Iterates loaded tiles with their slot index, in slot order
    pub fn tiles(&self) -> impl Iterator<Item = (usize, &MeshTile)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.tile.as_ref().map(|t| (i, t)))
    }

    pub fn poly_ref_base(&self, tile_idx: usize) -> PolyRef {
        self.encode_poly_ref(tile_idx, 0)
    }

    /// Reference to polygon `poly_idx` of the tile in slot `tile_idx`
    pub fn encode_poly_ref(&self, tile_idx: usize, poly_idx: usize) -> PolyRef {
        let salt = self.slots.get(tile_idx).map_or(0, |s| s.salt);
        self.layout
            .encode(salt, tile_idx as u32, poly_idx as u32)
    }

    /// Resolves a reference, checking slot, salt and polygon index
    pub fn get_tile_and_poly_by_ref(&self, reference: PolyRef) -> Result<(&MeshTile, &Poly)> {
        let (tile, poly_idx) = self.get_tile_and_poly_index(reference)?;
        Ok((tile, &tile.polys[poly_idx]))
    }

    /// Like [`Self::get_tile_and_poly_by_ref`] but returns the polygon index
    pub fn get_tile_and_poly_index(&self, reference: PolyRef) -> Result<(&MeshTile, usize)> {
        if reference.is_null() {
            return Err(Error::NotFound("null poly ref".to_string()));
        }
        let decoded = self.layout.decode(reference);
        let tile = self
            .slots
            .get(decoded.tile as usize)
            .and_then(|s| s.tile.as_ref())
            .ok_or_else(|| Error::NotFound(format!("{reference}: tile not loaded")))?;
        if tile.salt != decoded.salt {
            return Err(Error::NotFound(format!("{reference}: stale salt")));
        }
        let poly_idx = decoded.poly as usize;
        if poly_idx >= tile.polys.len() {
            return Err(Error::NotFound(format!("{reference}: poly out of range")));
        }
        Ok((tile, poly_idx))
    }

    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        self.get_tile_and_poly_index(reference).is_ok()
    }

    /// Ground polygons passing `filter` whose bounds overlap the box
    pub fn query_polygons(&self, bmin: &Vec3, bmax: &Vec3, filter: &QueryFilter) -> Vec<PolyRef> {
        let query = BoundingBox::new(*bmin, *bmax);
        let (minx, miny) = self.calc_tile_loc(bmin);
        let (maxx, maxy) = self.calc_tile_loc(bmax);
        let mut result = Vec::new();
        for ty in miny..=maxy {
            for tx in minx..=maxx {
                let Some(&idx) = self.pos_lookup.get(&(tx, ty)) else {
                    continue;
                };
                let Some(tile) = self.slots[idx].tile.as_ref() else {
                    continue;
                };
                for (i, poly) in tile.polys.iter().enumerate() {
                    if poly.is_off_mesh() || !filter.pass_filter(poly) {
                        continue;
                    }
                    if tile.poly_bounds(poly).intersects(&query) {
                        result.push(self.encode_poly_ref(idx, i));
                    }
                }
            }
        }
        result
    }

    /// Closest point on a polygon and whether `pos` lies over it
    pub fn closest_point_on_poly(&self, reference: PolyRef, pos: &Vec3) -> Result<(Vec3, bool)> {
        let (tile, idx) = self.get_tile_and_poly_index(reference)?;
        Ok(tile.closest_point_on_poly(idx, pos))
    }

    pub fn closest_point_on_poly_boundary(&self, reference: PolyRef, pos: &Vec3) -> Result<Vec3> {
        let (tile, idx) = self.get_tile_and_poly_index(reference)?;
        Ok(tile.closest_point_on_poly_boundary(idx, pos))
    }

    /// Surface height at `pos`; `None` for stale refs or points outside
    pub fn poly_height(&self, reference: PolyRef, pos: &Vec3) -> Option<f32> {
        let (tile, idx) = self.get_tile_and_poly_index(reference).ok()?;
        tile.poly_height(idx, pos)
    }

    /// Entry and exit points of an off-mesh polygon when entered from `prev_ref`
    pub fn off_mesh_connection_endpoints(
        &self,
        prev_ref: PolyRef,
        poly_ref: PolyRef,
    ) -> Result<(Vec3, Vec3)> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(poly_ref)?;
        if !poly.is_off_mesh() {
            return Err(Error::InvalidParam(format!(
                "{poly_ref} is not an off-mesh connection"
            )));
        }
        let (mut i0, mut i1) = (0, 1);
        if let Some(link) = tile.links_of(poly).find(|l| l.edge == 0) {
            if link.reference != prev_ref {
                i0 = 1;
                i1 = 0;
            }
        }
        Ok((
            tile.verts[poly.verts[i0] as usize],
            tile.verts[poly.verts[i1] as usize],
        ))
    }

    /// Vertices and triangle indices of a loaded tile's ground polygons
    pub fn tile_geometry(&self, x: i32, y: i32) -> Option<(Vec<Vec3>, Vec<u32>)> {
        let tile = self.tile_at(x, y)?;
        let mut indices = Vec::new();
        for poly in tile.polys.iter().filter(|p| !p.is_off_mesh()) {
            let v = poly.vert_indices();
            for i in 2..v.len() {
                indices.extend_from_slice(&[v[0] as u32, v[i - 1] as u32, v[i] as u32]);
            }
        }
        Some((tile.verts.clone(), indices))
    }

    fn connect_int_links(&mut self, tile_idx: usize) {
        let layout = self.layout;
        let Some(tile) = self.slots[tile_idx].tile.as_mut() else {
            return;
        };
        let salt = tile.salt;
        for pi in 0..tile.polys.len() {
            let poly = tile.polys[pi].clone();
            if poly.is_off_mesh() {
                continue;
            }
            // Prepending in reverse keeps the chain in edge order
            for j in (0..poly.vert_count as usize).rev() {
                let nei = poly.neis[j];
                if nei == 0 || nei & EXT_LINK != 0 {
                    continue;
                }
                tile.add_link(
                    pi,
                    Link {
                        reference: layout.encode(salt, tile_idx as u32, u32::from(nei - 1)),
                        next: None,
                        edge: j as u8,
                        side: LINK_SIDE_INTERNAL,
                        bmin: 0,
                        bmax: 0,
                    },
                );
            }
        }
    }

    fn connect_off_mesh_links(&mut self, tile_idx: usize) {
        let layout = self.layout;
        let Some(tile) = self.slots[tile_idx].tile.as_mut() else {
            return;
        };
        let salt = tile.salt;
        let encode = |poly: usize| layout.encode(salt, tile_idx as u32, poly as u32);
        let climb = tile.header.walkable_climb;

        for con in tile.off_mesh_connections.clone() {
            let con_poly = con.poly as usize;
            let ext = Vec3::new(con.radius, climb, con.radius);

            for (vertex, pos) in [(0usize, con.start), (1usize, con.end)] {
                let Some((land, nearest)) = tile.find_nearest_poly_in_tile(&pos, &ext) else {
                    continue;
                };
                if sqr(nearest.x - pos.x) + sqr(nearest.z - pos.z) > sqr(con.radius) {
                    continue;
                }
                let v = tile.polys[con_poly].verts[vertex] as usize;
                tile.verts[v] = nearest;

                tile.add_link(
                    con_poly,
                    Link {
                        reference: encode(land),
                        next: None,
                        edge: vertex as u8,
                        side: LINK_SIDE_INTERNAL,
                        bmin: 0,
                        bmax: 0,
                    },
                );
                if vertex == 0 || con.is_bidirectional() {
                    tile.add_link(
                        land,
                        Link {
                            reference: encode(con_poly),
                            next: None,
                            edge: LINK_EDGE_OFFMESH,
                            side: LINK_SIDE_INTERNAL,
                            bmin: 0,
                            bmax: 0,
                        },
                    );
                }
            }
        }
    }

    /// Links the portal edges of `tile_idx` on `side` to `target_idx`
    fn connect_ext_links(&mut self, tile_idx: usize, target_idx: usize, side: u8) {
        let (Some(tile), Some(target)) = (
            self.slots[tile_idx].tile.as_ref(),
            self.slots[target_idx].tile.as_ref(),
        ) else {
            return;
        };

        let opposite = opposite_side(side);
        let mut new_links = Vec::new();
        for (pi, poly) in tile.polys.iter().enumerate() {
            if poly.is_off_mesh() {
                continue;
            }
            let nv = poly.vert_count as usize;
            for j in 0..nv {
                let nei = poly.neis[j];
                if nei & EXT_LINK == 0 || (nei & 0xff) as u8 != side {
                    continue;
                }
                let va = tile.verts[poly.verts[j] as usize];
                let vb = tile.verts[poly.verts[(j + 1) % nv] as usize];
                for (target_poly, umin, umax) in find_connecting_polys(&va, &vb, target, opposite) {
                    let (a, b) = if side == 0 || side == 4 {
                        (va.z, vb.z)
                    } else {
                        (va.x, vb.x)
                    };
                    let (mut tmin, mut tmax) = ((umin - a) / (b - a), (umax - a) / (b - a));
                    if tmin > tmax {
                        std::mem::swap(&mut tmin, &mut tmax);
                    }
                    new_links.push((
                        pi,
                        Link {
                            reference: self.encode_poly_ref(target_idx, target_poly),
                            next: None,
                            edge: j as u8,
                            side,
                            bmin: (tmin.clamp(0.0, 1.0) * 255.0).round() as u8,
                            bmax: (tmax.clamp(0.0, 1.0) * 255.0).round() as u8,
                        },
                    ));
                }
            }
        }

        if let Some(tile) = self.slots[tile_idx].tile.as_mut() {
            for (pi, link) in new_links {
                tile.add_link(pi, link);
            }
        }
    }
}

/// Grid offset of the neighbour across a tile side
fn side_offset(side: u8) -> (i32, i32) {
    match side & 7 {
        0 => (1, 0),
        1 => (1, 1),
        2 => (0, 1),
        3 => (-1, 1),
        4 => (-1, 0),
        5 => (-1, -1),
        6 => (0, -1),
        _ => (1, -1),
    }
}

fn opposite_side(side: u8) -> u8 {
    (side + 4) & 7
}

/// Coordinate of the boundary line a portal edge lies on
fn slab_coord(v: &Vec3, side: u8) -> f32 {
    if side == 0 || side == 4 {
        v.x
    } else {
        v.z
    }
}

/// Portal edge end points as (along-boundary, height) pairs, ordered
fn slab_end_points(va: &Vec3, vb: &Vec3, side: u8) -> ([f32; 2], [f32; 2]) {
    let (ua, ub) = if side == 0 || side == 4 {
        (va.z, vb.z)
    } else {
        (va.x, vb.x)
    };
    if ua < ub {
        ([ua, va.y], [ub, vb.y])
    } else {
        ([ub, vb.y], [ua, va.y])
    }
}

fn overlap_slabs(
    amin: [f32; 2],
    amax: [f32; 2],
    bmin: [f32; 2],
    bmax: [f32; 2],
    climb: f32,
) -> bool {
    let minx = (amin[0] + PORTAL_EPSILON).max(bmin[0] + PORTAL_EPSILON);
    let maxx = (amax[0] - PORTAL_EPSILON).min(bmax[0] - PORTAL_EPSILON);
    if minx > maxx {
        return false;
    }
    let height_at = |lo: [f32; 2], hi: [f32; 2], x: f32| {
        let span = hi[0] - lo[0];
        if span.abs() < f32::EPSILON {
            lo[1]
        } else {
            lo[1] + (hi[1] - lo[1]) * (x - lo[0]) / span
        }
    };
    let dmin = height_at(bmin, bmax, minx) - height_at(amin, amax, minx);
    let dmax = height_at(bmin, bmax, maxx) - height_at(amin, amax, maxx);
    if dmin * dmax < 0.0 {
        return true;
    }
    let thr = sqr(climb * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}

/// Polygons of `target` whose portal edges on `side` overlap `va`-`vb`,
/// with the overlapping range along the boundary
fn find_connecting_polys(
    va: &Vec3,
    vb: &Vec3,
    target: &MeshTile,
    side: u8,
) -> Vec<(usize, f32, f32)> {
    let (amin, amax) = slab_end_points(va, vb, side);
    let apos = slab_coord(va, side);
    let climb = target.header.walkable_climb;
    let marker = EXT_LINK | u16::from(side);

    let mut result = Vec::new();
    for (pi, poly) in target.polys.iter().enumerate() {
        if poly.is_off_mesh() {
            continue;
        }
        let nv = poly.vert_count as usize;
        for j in 0..nv {
            if poly.neis[j] != marker {
                continue;
            }
            let vc = target.verts[poly.verts[j] as usize];
            let vd = target.verts[poly.verts[(j + 1) % nv] as usize];
            if (apos - slab_coord(&vc, side)).abs() > PORTAL_EPSILON {
                continue;
            }
            let (bmin, bmax) = slab_end_points(&vc, &vd, side);
            if !overlap_slabs(amin, amax, bmin, bmax, climb) {
                continue;
            }
            result.push((pi, amin[0].max(bmin[0]), amax[0].min(bmax[0])));
            break;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{grid_tile, grid_tile_bytes};

    #[test]
    fn test_init_validates_bits() {
        assert!(NavMesh::init(32.0, 10, 8).is_ok());
        assert!(NavMesh::init(32.0, 40, 8).is_err());
        assert!(NavMesh::init(32.0, 30, 30).is_err());
        assert!(NavMesh::init(0.0, 10, 8).is_err());
        assert!(NavMesh::init(-1.0, 10, 8).is_err());
    }

    #[test]
    fn test_add_tile_and_lookup() -> Result<()> {
        let mut mesh = NavMesh::init(4.0, 4, 8)?;
        let base = mesh.add_tile(&grid_tile_bytes(0, 0, 4.0, 2))?;
        assert_eq!(mesh.tile_count(), 1);
        assert!(mesh.is_valid_poly_ref(base));
        let tile = mesh.tile_at(0, 0).expect("tile loaded");
        assert_eq!(tile.polys.len(), 4);
        assert_eq!(mesh.tile_ref_at(0, 0), Some(base));
        Ok(())
    }

    #[test]
    fn test_add_tile_twice_is_already_loaded() -> Result<()> {
        let mut mesh = NavMesh::init(4.0, 4, 8)?;
        let bytes = grid_tile_bytes(1, 2, 4.0, 2);
        mesh.add_tile(&bytes)?;
        match mesh.add_tile(&bytes) {
            Err(Error::AlreadyLoaded { x: 1, y: 2 }) => {}
            other => panic!("expected AlreadyLoaded, got {other:?}"),
        }
        assert_eq!(mesh.tile_count(), 1);
        Ok(())
    }

    #[test]
    fn test_add_malformed_tile() -> Result<()> {
        let mut mesh = NavMesh::init(4.0, 4, 8)?;
        assert!(matches!(mesh.add_tile(&[1, 2, 3]), Err(Error::InvalidTile(_))));

        let mut bytes = grid_tile_bytes(0, 0, 4.0, 2);
        bytes.truncate(bytes.len() - 10);
        assert!(matches!(mesh.add_tile(&bytes), Err(Error::InvalidTile(_))));

        let mut bytes = grid_tile_bytes(0, 0, 4.0, 2);
        bytes[0] ^= 0xff;
        assert!(matches!(mesh.add_tile(&bytes), Err(Error::InvalidTile(_))));
        assert_eq!(mesh.tile_count(), 0);
        Ok(())
    }

    #[test]
    fn test_too_many_polys_for_layout() -> Result<()> {
        // 2 poly bits address 4 polygons; a 3x3 grid has 9
        let mut mesh = NavMesh::init(6.0, 4, 2)?;
        assert!(matches!(
            mesh.add_tile(&grid_tile_bytes(0, 0, 6.0, 3)),
            Err(Error::InvalidTile(_))
        ));
        Ok(())
    }

    #[test]
    fn test_tile_slots_exhausted() -> Result<()> {
        let mut mesh = NavMesh::init(4.0, 1, 8)?;
        mesh.add_tile(&grid_tile_bytes(0, 0, 4.0, 1))?;
        mesh.add_tile(&grid_tile_bytes(1, 0, 4.0, 1))?;
        assert!(matches!(
            mesh.add_tile(&grid_tile_bytes(2, 0, 4.0, 1)),
            Err(Error::CapacityExceeded(_))
        ));
        Ok(())
    }

    #[test]
    fn test_remove_tile_invalidates_refs() -> Result<()> {
        let mut mesh = NavMesh::init(4.0, 4, 8)?;
        let bytes = grid_tile_bytes(0, 0, 4.0, 2);
        let old = mesh.add_tile(&bytes)?;

        assert!(mesh.remove_tile(0, 0));
        assert!(!mesh.is_valid_poly_ref(old));
        assert!(!mesh.remove_tile(0, 0));

        // Same slot comes back with a new salt
        let new = mesh.add_tile(&bytes)?;
        assert_ne!(old, new);
        assert!(!mesh.is_valid_poly_ref(old));
        assert!(mesh.is_valid_poly_ref(new));
        assert_eq!(
            mesh.layout().decode(old).tile,
            mesh.layout().decode(new).tile
        );
        Ok(())
    }

    #[test]
    fn test_add_or_replace_tile() -> Result<()> {
        let mut mesh = NavMesh::init(4.0, 4, 8)?;
        let first = mesh.add_tile(&grid_tile_bytes(0, 0, 4.0, 2))?;
        let second = mesh.add_or_replace_tile(&grid_tile_bytes(0, 0, 4.0, 1))?;
        assert_eq!(mesh.tile_count(), 1);
        assert!(!mesh.is_valid_poly_ref(first));
        assert!(mesh.is_valid_poly_ref(second));
        assert_eq!(mesh.tile_at(0, 0).map(|t| t.polys.len()), Some(1));
        Ok(())
    }

    #[test]
    fn test_internal_links_follow_neighbours() -> Result<()> {
        let mut mesh = NavMesh::init(4.0, 4, 8)?;
        mesh.add_tile(&grid_tile_bytes(0, 0, 4.0, 2))?;
        let tile = mesh.tile_at(0, 0).expect("tile loaded");
        // Corner cells of a 2x2 grid have exactly two internal neighbours
        for poly in &tile.polys {
            assert_eq!(tile.links_of(poly).count(), 2);
        }
        Ok(())
    }

    #[test]
    fn test_poly_height_and_closest_point() -> Result<()> {
        let mut mesh = NavMesh::init(4.0, 4, 8)?;
        let base = mesh.add_tile(&grid_tile_bytes(0, 0, 4.0, 2))?;
        let h = mesh.poly_height(base, &Vec3::new(0.5, 10.0, 0.5));
        assert_eq!(h, Some(0.0));
        assert_eq!(mesh.poly_height(base, &Vec3::new(3.5, 0.0, 3.5)), None);

        let (p, over) = mesh.closest_point_on_poly(base, &Vec3::new(-1.0, 0.0, 1.0))?;
        assert!(!over);
        assert!((p - Vec3::new(0.0, 0.0, 1.0)).length() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_tile_geometry_triangulates() -> Result<()> {
        let mut mesh = NavMesh::init(4.0, 4, 8)?;
        mesh.add_tile(&grid_tile_bytes(0, 0, 4.0, 2))?;
        let (verts, indices) = mesh.tile_geometry(0, 0).expect("tile loaded");
        assert_eq!(verts.len(), 9);
        // Four quads, two triangles each
        assert_eq!(indices.len(), 4 * 2 * 3);
        assert!(mesh.tile_geometry(5, 5).is_none());
        Ok(())
    }

    #[test]
    fn test_grid_tile_payload_matches_builder() -> Result<()> {
        let data = grid_tile(0, 0, 4.0, 2)?;
        assert_eq!(data.polys.len(), 4);
        assert_eq!(data.header.bmax, Vec3::new(4.0, 0.0, 4.0));
        Ok(())
    }
}
