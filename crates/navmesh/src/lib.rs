//! Tiled navigation mesh and spatial queries
//!
//! This crate owns the runtime side of a tiled navigation mesh: loading and
//! unloading serialized polygon tiles on a 2D grid, resolving opaque polygon
//! references, and answering spatial queries against the loaded tiles.
//!
//! # Features
//!
//! - **Tiled storage**: tiles keyed by grid coordinate, linked to their
//!   neighbours when loaded and detached when removed
//! - **Checked references**: [`PolyRef`] values carry a salt that is
//!   compared on every lookup, so stale references fail cleanly
//! - **Queries**: nearest polygon, A* path search with a fixed node budget,
//!   straight paths, raycasts, surface sampling and random points
//!
//! # Example
//!
//! ```rust,ignore
//! use navmesh::{NavMesh, NavMeshQuery, NavQuerySettings, QueryFilter};
//!
//! let mut nav_mesh = NavMesh::init(32.0, 10, 8)?;
//! nav_mesh.add_tile(&tile_bytes)?;
//!
//! let mut query = NavMeshQuery::new(&nav_mesh, 2048)?;
//! let path = query.find_straight_path_between(
//!     &start,
//!     &end,
//!     &NavQuerySettings::default(),
//!     &QueryFilter::default(),
//! )?;
//! ```

pub mod binary_format;
pub mod nav_mesh;
pub mod nav_mesh_query;
pub mod node_pool;
pub mod poly_ref;
pub mod query_filter;
pub mod raycast_hit;
pub mod settings;
pub mod status;
pub mod tile_builder;

pub use binary_format::{TileData, NAVMESH_MAGIC, NAVMESH_VERSION};
pub use nav_mesh::{
    Link, MeshTile, NavMesh, NavMeshParams, OffMeshConnection, Poly, PolyDetail, TileHeader,
};
pub use nav_mesh_query::{
    NavMeshQuery, PolyPath, StraightPath, StraightPathFlags, StraightPathPoint,
};
pub use node_pool::{Node, NodeFlags, NodePool, NodeQueue};
pub use poly_ref::{DecodedRef, PolyRef, RefLayout};
pub use query_filter::QueryFilter;
pub use raycast_hit::RaycastHit;
pub use settings::{NavMeshSettings, NavQuerySettings};
pub use status::Status;
pub use tile_builder::TileBuilder;

#[cfg(test)]
mod test_mesh_helpers;

#[cfg(test)]
mod spatial_query_tests;

/// Maximum number of vertices per polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Number of area ids a polygon can carry
pub const MAX_AREAS: usize = 64;

/// Library version reported to hosts
pub const VERSION: i32 = 1;

/// Returns the navmesh library version
pub fn version() -> i32 {
    VERSION
}

bitflags::bitflags! {
    /// Polygon flags used by query filters
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct PolyFlags: u16 {
        /// Ability to walk (ground, grass, road)
        const WALK = 0x01;
        /// Ability to swim (water)
        const SWIM = 0x02;
        /// Ability to move through doors
        const DOOR = 0x04;
        /// Ability to jump
        const JUMP = 0x08;
        /// Disabled polygon
        const DISABLED = 0x10;
    }
}

/// Type of a navigation polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum PolyType {
    /// Regular walkable polygon
    #[default]
    Ground = 0,
    /// Two-vertex polygon standing in for an off-mesh connection
    OffMeshConnection = 1,
}

impl PolyType {
    pub(crate) fn from_bits(bits: u8) -> Self {
        if bits == 1 {
            PolyType::OffMeshConnection
        } else {
            PolyType::Ground
        }
    }
}
