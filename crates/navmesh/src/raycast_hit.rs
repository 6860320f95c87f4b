//! Raycast hit information

use glam::Vec3;

use super::PolyRef;

/// Result of walking a segment along the navigation surface
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Fraction of the segment travelled before a wall, in `[0, 1]`.
    /// `1.0` when the end point was reached unobstructed.
    pub t: f32,

    /// XZ-plane normal of the blocking edge; zero when nothing was hit
    pub hit_normal: Vec3,

    /// Edge of the last visited polygon that blocked the ray
    pub hit_edge_index: Option<usize>,

    /// Polygons visited, in order
    pub path: Vec<PolyRef>,

    /// Set when `path` was cut short by its capacity
    pub partial: bool,
}

impl RaycastHit {
    /// A ray that reached its end point
    pub fn no_hit(path: Vec<PolyRef>) -> Self {
        Self {
            t: 1.0,
            hit_normal: Vec3::ZERO,
            hit_edge_index: None,
            path,
            partial: false,
        }
    }

    /// A ray stopped by the edge `edge_index` at fraction `t`
    pub fn wall_hit(t: f32, normal: Vec3, edge_index: usize, path: Vec<PolyRef>) -> Self {
        Self {
            t,
            hit_normal: normal,
            hit_edge_index: Some(edge_index),
            path,
            partial: false,
        }
    }

    /// Checks if this represents a wall hit
    pub fn hit_wall(&self) -> bool {
        self.t < 1.0
    }

    /// Point where the ray stopped, for a ray cast from `start` to `end`
    pub fn hit_position(&self, start: Vec3, end: Vec3) -> Vec3 {
        start.lerp(end, self.t)
    }

    pub fn path_count(&self) -> usize {
        self.path.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raycast_hit_no_hit() {
        let hit = RaycastHit::no_hit(Vec::new());
        assert_eq!(hit.t, 1.0);
        assert!(!hit.hit_wall());
        assert_eq!(hit.path_count(), 0);
        assert_eq!(hit.hit_edge_index, None);
    }

    #[test]
    fn test_raycast_hit_wall() {
        let path = vec![PolyRef::new(1), PolyRef::new(2), PolyRef::new(3)];
        let hit = RaycastHit::wall_hit(0.5, Vec3::X, 2, path.clone());
        assert!(hit.hit_wall());
        assert_eq!(hit.hit_edge_index, Some(2));
        assert_eq!(hit.path, path);

        let p = hit.hit_position(Vec3::ZERO, Vec3::new(4.0, 0.0, 2.0));
        assert_eq!(p, Vec3::new(2.0, 0.0, 1.0));
    }
}
