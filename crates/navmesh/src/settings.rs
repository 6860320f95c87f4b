//! Navigation mesh and query settings

use glam::Vec3;

use super::NavMesh;
use nav_common::{Result, tile_bits_for_map};

/// Bits of a polygon reference spent on the polygon index
pub const POLY_BITS: u32 = 8;

/// Sizing of a navigation mesh covering a square map
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct NavMeshSettings {
    /// Tile edge length in cells
    pub tile_size: i32,
    /// World size of one cell
    pub cell_size: f32,
    /// World edge length of the map
    pub map_size: f32,
    /// Node budget of queries created for this mesh
    pub query_max_nodes: usize,
    /// Point budget of straight paths
    pub query_max_path_points: usize,
}

impl Default for NavMeshSettings {
    fn default() -> Self {
        Self {
            tile_size: 64,
            cell_size: 0.3,
            map_size: 1024.0,
            query_max_nodes: 4096,
            query_max_path_points: 512,
        }
    }
}

impl NavMeshSettings {
    /// World edge length of one tile
    pub fn cell_tile_size(&self) -> f32 {
        self.tile_size as f32 * self.cell_size
    }

    /// Tile-index bits needed to address every tile of the map
    pub fn tile_bits(&self) -> u32 {
        tile_bits_for_map(self.tile_size, self.cell_size, self.map_size).max(1)
    }

    pub fn poly_bits(&self) -> u32 {
        POLY_BITS
    }

    /// Loads settings from JSON; missing fields keep their defaults
    #[cfg(feature = "serialization")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| nav_common::Error::InvalidParam(format!("navmesh settings: {e}")))
    }
}

impl NavMesh {
    /// Creates an empty mesh sized by `settings`
    pub fn from_settings(settings: &NavMeshSettings) -> Result<Self> {
        NavMesh::init(
            settings.cell_tile_size(),
            settings.tile_bits(),
            settings.poly_bits(),
        )
    }
}

/// Parameters for queries that start from world positions
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct NavQuerySettings {
    /// Half extents of the box searched when snapping a point to the mesh
    pub find_nearest_poly_extent: Vec3,
    /// Point budget of straight paths
    pub max_path_points: usize,
}

impl Default for NavQuerySettings {
    fn default() -> Self {
        Self {
            find_nearest_poly_extent: Vec3::new(2.0, 4.0, 2.0),
            max_path_points: 512,
        }
    }
}

impl NavQuerySettings {
    /// Wide search box and long paths
    pub fn lenient() -> Self {
        Self {
            find_nearest_poly_extent: Vec3::new(10.0, 10.0, 10.0),
            max_path_points: 2048,
        }
    }

    #[cfg(feature = "serialization")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| nav_common::Error::InvalidParam(format!("query settings: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = NavMeshSettings::default();
        assert!((settings.cell_tile_size() - 19.2).abs() < 1e-4);
        // (1024 / 19.2)^2 = 2844.4 tiles -> 4096 -> 12 bits
        assert_eq!(settings.tile_bits(), 12);
        assert_eq!(settings.poly_bits(), 8);
    }

    #[test]
    fn test_from_settings() -> Result<()> {
        let mesh = NavMesh::from_settings(&NavMeshSettings::default())?;
        assert_eq!(mesh.max_tiles(), 4096);
        Ok(())
    }

    #[test]
    fn test_query_settings() {
        let default = NavQuerySettings::default();
        assert_eq!(default.find_nearest_poly_extent, Vec3::new(2.0, 4.0, 2.0));
        assert_eq!(default.max_path_points, 512);
        let lenient = NavQuerySettings::lenient();
        assert_eq!(lenient.find_nearest_poly_extent, Vec3::splat(10.0));
        assert_eq!(lenient.max_path_points, 2048);
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_settings_from_json() -> Result<()> {
        let settings = NavMeshSettings::from_json_str(r#"{ "tile_size": 32, "map_size": 512.0 }"#)?;
        assert_eq!(settings.tile_size, 32);
        assert_eq!(settings.cell_size, 0.3);
        assert!(NavMeshSettings::from_json_str("{ nope").is_err());
        Ok(())
    }
}
