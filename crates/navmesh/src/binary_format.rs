//! Tile payload format
//!
//! Tiles travel as little-endian byte buffers laid out like a Detour tile:
//! a fixed header followed by vertices, polygons, detail meshes, detail
//! vertices, detail triangles, bounding volume nodes and off-mesh
//! connections. Link records are rebuilt when a tile is loaded, so the
//! writer emits none and the reader skips any that are present. Bounding
//! volume nodes are skipped the same way.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use glam::Vec3;

use super::nav_mesh::{OffMeshConnection, Poly, PolyDetail, TileHeader, EXT_LINK};
use super::{PolyFlags, PolyType, MAX_VERTS_PER_POLY};
use nav_common::{align4, Error, Result};

/// Magic number for tile payloads ('DNAV')
pub const NAVMESH_MAGIC: u32 = 0x444E_4156; // 'D' << 24 | 'N' << 16 | 'A' << 8 | 'V'

/// Current tile payload version
pub const NAVMESH_VERSION: u32 = 7;

/// Size in bytes of the fixed header
pub const HEADER_SIZE: usize = 100;

const POLY_SIZE: usize = 32;
const LINK_SIZE: usize = 12;
const DETAIL_MESH_SIZE: usize = 12;
const DETAIL_TRI_SIZE: usize = 4;
const BV_NODE_SIZE: usize = 16;
const OFF_MESH_CON_SIZE: usize = 36;
const VERT_SIZE: usize = 12;

/// Null link value stored in a polygon's first link field
const NULL_LINK: u32 = 0xffff_ffff;

/// Fixed header as it appears in the payload
#[derive(Debug, Clone)]
struct MeshHeader {
    magic: u32,
    version: u32,
    x: i32,
    y: i32,
    layer: i32,
    user_id: u32,
    poly_count: i32,
    vert_count: i32,
    max_link_count: i32,
    detail_mesh_count: i32,
    detail_vert_count: i32,
    detail_tri_count: i32,
    bv_node_count: i32,
    off_mesh_con_count: i32,
    off_mesh_base: i32,
    walkable_height: f32,
    walkable_radius: f32,
    walkable_climb: f32,
    bmin: [f32; 3],
    bmax: [f32; 3],
    bv_quant_factor: f32,
}

impl MeshHeader {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            magic: reader.read_u32::<LittleEndian>()?,
            version: reader.read_u32::<LittleEndian>()?,
            x: reader.read_i32::<LittleEndian>()?,
            y: reader.read_i32::<LittleEndian>()?,
            layer: reader.read_i32::<LittleEndian>()?,
            user_id: reader.read_u32::<LittleEndian>()?,
            poly_count: reader.read_i32::<LittleEndian>()?,
            vert_count: reader.read_i32::<LittleEndian>()?,
            max_link_count: reader.read_i32::<LittleEndian>()?,
            detail_mesh_count: reader.read_i32::<LittleEndian>()?,
            detail_vert_count: reader.read_i32::<LittleEndian>()?,
            detail_tri_count: reader.read_i32::<LittleEndian>()?,
            bv_node_count: reader.read_i32::<LittleEndian>()?,
            off_mesh_con_count: reader.read_i32::<LittleEndian>()?,
            off_mesh_base: reader.read_i32::<LittleEndian>()?,
            walkable_height: reader.read_f32::<LittleEndian>()?,
            walkable_radius: reader.read_f32::<LittleEndian>()?,
            walkable_climb: reader.read_f32::<LittleEndian>()?,
            bmin: read_f32x3(reader)?,
            bmax: read_f32x3(reader)?,
            bv_quant_factor: reader.read_f32::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_i32::<LittleEndian>(self.x)?;
        writer.write_i32::<LittleEndian>(self.y)?;
        writer.write_i32::<LittleEndian>(self.layer)?;
        writer.write_u32::<LittleEndian>(self.user_id)?;
        writer.write_i32::<LittleEndian>(self.poly_count)?;
        writer.write_i32::<LittleEndian>(self.vert_count)?;
        writer.write_i32::<LittleEndian>(self.max_link_count)?;
        writer.write_i32::<LittleEndian>(self.detail_mesh_count)?;
        writer.write_i32::<LittleEndian>(self.detail_vert_count)?;
        writer.write_i32::<LittleEndian>(self.detail_tri_count)?;
        writer.write_i32::<LittleEndian>(self.bv_node_count)?;
        writer.write_i32::<LittleEndian>(self.off_mesh_con_count)?;
        writer.write_i32::<LittleEndian>(self.off_mesh_base)?;
        writer.write_f32::<LittleEndian>(self.walkable_height)?;
        writer.write_f32::<LittleEndian>(self.walkable_radius)?;
        writer.write_f32::<LittleEndian>(self.walkable_climb)?;
        write_f32x3(writer, self.bmin)?;
        write_f32x3(writer, self.bmax)?;
        writer.write_f32::<LittleEndian>(self.bv_quant_factor)?;
        Ok(())
    }

    fn count(value: i32, what: &str) -> Result<usize> {
        usize::try_from(value)
            .map_err(|_| Error::InvalidTile(format!("negative {what} count {value}")))
    }

    fn to_tile_header(&self) -> TileHeader {
        TileHeader {
            x: self.x,
            y: self.y,
            layer: self.layer,
            user_id: self.user_id,
            off_mesh_base: self.off_mesh_base,
            walkable_height: self.walkable_height,
            walkable_radius: self.walkable_radius,
            walkable_climb: self.walkable_climb,
            bmin: Vec3::from_array(self.bmin),
            bmax: Vec3::from_array(self.bmax),
            bv_quant_factor: self.bv_quant_factor,
        }
    }
}

fn read_f32x3<R: Read>(reader: &mut R) -> io::Result<[f32; 3]> {
    Ok([
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ])
}

fn write_f32x3<W: Write>(writer: &mut W, v: [f32; 3]) -> io::Result<()> {
    writer.write_f32::<LittleEndian>(v[0])?;
    writer.write_f32::<LittleEndian>(v[1])?;
    writer.write_f32::<LittleEndian>(v[2])?;
    Ok(())
}

fn read_poly<R: Read>(reader: &mut R) -> io::Result<Poly> {
    let _first_link = reader.read_u32::<LittleEndian>()?;

    let mut verts = [0u16; MAX_VERTS_PER_POLY];
    for v in &mut verts {
        *v = reader.read_u16::<LittleEndian>()?;
    }

    let mut neis = [0u16; MAX_VERTS_PER_POLY];
    for n in &mut neis {
        *n = reader.read_u16::<LittleEndian>()?;
    }

    let flags = PolyFlags::from_bits_truncate(reader.read_u16::<LittleEndian>()?);
    let vert_count = reader.read_u8()?;
    let area_and_type = reader.read_u8()?;

    Ok(Poly {
        first_link: None,
        verts,
        neis,
        flags,
        vert_count,
        area: area_and_type & 0x3f,
        poly_type: PolyType::from_bits(area_and_type >> 6),
    })
}

fn write_poly<W: Write>(writer: &mut W, poly: &Poly) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(NULL_LINK)?;
    for &v in &poly.verts {
        writer.write_u16::<LittleEndian>(v)?;
    }
    for &n in &poly.neis {
        writer.write_u16::<LittleEndian>(n)?;
    }
    writer.write_u16::<LittleEndian>(poly.flags.bits())?;
    writer.write_u8(poly.vert_count)?;
    writer.write_u8((poly.area & 0x3f) | ((poly.poly_type as u8) << 6))?;
    Ok(())
}

fn read_detail_mesh<R: Read>(reader: &mut R) -> io::Result<PolyDetail> {
    let detail = PolyDetail {
        vert_base: reader.read_u32::<LittleEndian>()?,
        tri_base: reader.read_u32::<LittleEndian>()?,
        vert_count: reader.read_u8()?,
        tri_count: reader.read_u8()?,
    };
    reader.read_u16::<LittleEndian>()?; // padding
    Ok(detail)
}

fn write_detail_mesh<W: Write>(writer: &mut W, detail: &PolyDetail) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(detail.vert_base)?;
    writer.write_u32::<LittleEndian>(detail.tri_base)?;
    writer.write_u8(detail.vert_count)?;
    writer.write_u8(detail.tri_count)?;
    writer.write_u16::<LittleEndian>(0)?;
    Ok(())
}

fn read_off_mesh_connection<R: Read>(reader: &mut R) -> io::Result<OffMeshConnection> {
    Ok(OffMeshConnection {
        start: Vec3::from_array(read_f32x3(reader)?),
        end: Vec3::from_array(read_f32x3(reader)?),
        radius: reader.read_f32::<LittleEndian>()?,
        poly: reader.read_u16::<LittleEndian>()?,
        flags: reader.read_u8()?,
        side: reader.read_u8()?,
        user_id: reader.read_u32::<LittleEndian>()?,
    })
}

fn write_off_mesh_connection<W: Write>(writer: &mut W, con: &OffMeshConnection) -> io::Result<()> {
    write_f32x3(writer, con.start.to_array())?;
    write_f32x3(writer, con.end.to_array())?;
    writer.write_f32::<LittleEndian>(con.radius)?;
    writer.write_u16::<LittleEndian>(con.poly)?;
    writer.write_u8(con.flags)?;
    writer.write_u8(con.side)?;
    writer.write_u32::<LittleEndian>(con.user_id)?;
    Ok(())
}

fn skip<R: Read>(reader: &mut R, bytes: usize) -> io::Result<()> {
    let copied = io::copy(&mut reader.take(bytes as u64), &mut io::sink())?;
    if copied as usize != bytes {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    Ok(())
}

fn truncated(err: io::Error) -> Error {
    Error::InvalidTile(format!("truncated tile data: {err}"))
}

/// Decoded contents of one tile payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileData {
    pub header: TileHeader,
    pub verts: Vec<Vec3>,
    pub polys: Vec<Poly>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<Vec3>,
    pub detail_tris: Vec<[u8; 4]>,
    pub off_mesh_connections: Vec<OffMeshConnection>,
}

impl TileData {
    /// Decodes a payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        Self::read_from(&mut cursor)
    }

    /// Reads only the header fields of a payload
    pub fn peek_header(data: &[u8]) -> Result<TileHeader> {
        let raw = Self::read_checked_header(&mut Cursor::new(data))?;
        Ok(raw.to_tile_header())
    }

    fn read_checked_header<R: Read>(reader: &mut R) -> Result<MeshHeader> {
        let raw = MeshHeader::read_from(reader).map_err(truncated)?;
        if raw.magic != NAVMESH_MAGIC {
            return Err(Error::InvalidTile(format!(
                "wrong magic {:#010x}",
                raw.magic
            )));
        }
        if raw.version != NAVMESH_VERSION {
            return Err(Error::InvalidTile(format!(
                "unsupported version {}",
                raw.version
            )));
        }
        Ok(raw)
    }

    /// Reads a payload from a stream
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let raw = Self::read_checked_header(reader)?;

        let poly_count = MeshHeader::count(raw.poly_count, "polygon")?;
        let vert_count = MeshHeader::count(raw.vert_count, "vertex")?;
        let link_count = MeshHeader::count(raw.max_link_count, "link")?;
        let detail_mesh_count = MeshHeader::count(raw.detail_mesh_count, "detail mesh")?;
        let detail_vert_count = MeshHeader::count(raw.detail_vert_count, "detail vertex")?;
        let detail_tri_count = MeshHeader::count(raw.detail_tri_count, "detail triangle")?;
        let bv_node_count = MeshHeader::count(raw.bv_node_count, "bv node")?;
        let off_mesh_count = MeshHeader::count(raw.off_mesh_con_count, "off-mesh connection")?;

        let mut body = || -> io::Result<TileData> {
            let mut data = TileData {
                header: raw.to_tile_header(),
                ..Default::default()
            };
            for _ in 0..vert_count {
                data.verts.push(Vec3::from_array(read_f32x3(reader)?));
            }
            for _ in 0..poly_count {
                data.polys.push(read_poly(reader)?);
            }
            skip(reader, link_count * LINK_SIZE)?;
            for _ in 0..detail_mesh_count {
                data.detail_meshes.push(read_detail_mesh(reader)?);
            }
            for _ in 0..detail_vert_count {
                data.detail_verts.push(Vec3::from_array(read_f32x3(reader)?));
            }
            for _ in 0..detail_tri_count {
                let mut tri = [0u8; 4];
                reader.read_exact(&mut tri)?;
                data.detail_tris.push(tri);
            }
            skip(reader, bv_node_count * BV_NODE_SIZE)?;
            for _ in 0..off_mesh_count {
                data.off_mesh_connections
                    .push(read_off_mesh_connection(reader)?);
            }
            Ok(data)
        };
        body().map_err(truncated)
    }

    /// Encodes the tile
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.encoded_size());
        self.write_to(&mut buffer)?;
        Ok(buffer)
    }

    /// Writes the tile to a stream
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let count = |n: usize, what: &str| {
            i32::try_from(n).map_err(|_| Error::InvalidParam(format!("too many {what}: {n}")))
        };
        let h = &self.header;
        let raw = MeshHeader {
            magic: NAVMESH_MAGIC,
            version: NAVMESH_VERSION,
            x: h.x,
            y: h.y,
            layer: h.layer,
            user_id: h.user_id,
            poly_count: count(self.polys.len(), "polygons")?,
            vert_count: count(self.verts.len(), "vertices")?,
            max_link_count: 0,
            detail_mesh_count: count(self.detail_meshes.len(), "detail meshes")?,
            detail_vert_count: count(self.detail_verts.len(), "detail vertices")?,
            detail_tri_count: count(self.detail_tris.len(), "detail triangles")?,
            bv_node_count: 0,
            off_mesh_con_count: count(self.off_mesh_connections.len(), "off-mesh connections")?,
            off_mesh_base: h.off_mesh_base,
            walkable_height: h.walkable_height,
            walkable_radius: h.walkable_radius,
            walkable_climb: h.walkable_climb,
            bmin: h.bmin.to_array(),
            bmax: h.bmax.to_array(),
            bv_quant_factor: h.bv_quant_factor,
        };

        raw.write_to(writer)?;
        for v in &self.verts {
            write_f32x3(writer, v.to_array())?;
        }
        for poly in &self.polys {
            write_poly(writer, poly)?;
        }
        for detail in &self.detail_meshes {
            write_detail_mesh(writer, detail)?;
        }
        for v in &self.detail_verts {
            write_f32x3(writer, v.to_array())?;
        }
        for tri in &self.detail_tris {
            writer.write_all(tri)?;
        }
        for con in &self.off_mesh_connections {
            write_off_mesh_connection(writer, con)?;
        }
        Ok(())
    }

    /// Size in bytes of the encoded payload
    pub fn encoded_size(&self) -> usize {
        align4(HEADER_SIZE)
            + align4(self.verts.len() * VERT_SIZE)
            + align4(self.polys.len() * POLY_SIZE)
            + align4(self.detail_meshes.len() * DETAIL_MESH_SIZE)
            + align4(self.detail_verts.len() * VERT_SIZE)
            + align4(self.detail_tris.len() * DETAIL_TRI_SIZE)
            + align4(self.off_mesh_connections.len() * OFF_MESH_CON_SIZE)
    }

    /// Checks internal consistency of the payload
    pub fn validate(&self, max_polys: u64) -> Result<()> {
        let bad = |msg: String| Err(Error::InvalidTile(msg));

        if self.polys.len() as u64 > max_polys {
            return bad(format!(
                "{} polygons exceed the {} addressable per tile",
                self.polys.len(),
                max_polys
            ));
        }
        if !self.header.bmin.cmple(self.header.bmax).all() {
            return bad("tile bounds are inverted".to_string());
        }

        let nverts = self.verts.len();
        let npolys = self.polys.len();
        for (i, poly) in self.polys.iter().enumerate() {
            let nv = poly.vert_count as usize;
            let min_verts = if poly.is_off_mesh() { 2 } else { 3 };
            if nv < min_verts || nv > MAX_VERTS_PER_POLY {
                return bad(format!("polygon {i} has {nv} vertices"));
            }
            if let Some(&v) = poly.vert_indices().iter().find(|&&v| v as usize >= nverts) {
                return bad(format!("polygon {i} references vertex {v} of {nverts}"));
            }
            for &nei in &poly.neis[..nv] {
                if nei != 0 && nei & EXT_LINK == 0 && nei as usize > npolys {
                    return bad(format!("polygon {i} has neighbour {} of {npolys}", nei - 1));
                }
            }
        }

        if !self.detail_meshes.is_empty() && self.detail_meshes.len() != npolys {
            return bad(format!(
                "{} detail meshes for {npolys} polygons",
                self.detail_meshes.len()
            ));
        }
        for (i, detail) in self.detail_meshes.iter().enumerate() {
            let vend = detail.vert_base as usize + detail.vert_count as usize;
            let tend = detail.tri_base as usize + detail.tri_count as usize;
            if vend > self.detail_verts.len() || tend > self.detail_tris.len() {
                return bad(format!("detail mesh {i} is out of range"));
            }
            let limit = self.polys[i].vert_count as usize + detail.vert_count as usize;
            let tris = &self.detail_tris[detail.tri_base as usize..tend];
            if tris.iter().any(|t| t[..3].iter().any(|&v| v as usize >= limit)) {
                return bad(format!("detail mesh {i} has a vertex out of range"));
            }
        }

        for (i, con) in self.off_mesh_connections.iter().enumerate() {
            match self.polys.get(con.poly as usize) {
                Some(poly) if poly.is_off_mesh() => {}
                _ => return bad(format!("off-mesh connection {i} has no polygon")),
            }
        }
        Ok(())
    }
}
