//! Path corridor for agent path following
//!
//! A corridor is the polygon path from the agent's current position to its
//! target. Moving the position patches the front of the path locally
//! instead of searching again.

use glam::Vec3;

use nav_common::{dist_2d, dist_sqr_2d, sqr, Error, Result};
use navmesh::{NavMesh, NavMeshQuery, PolyRef, QueryFilter, StraightPath, StraightPathFlags};

/// Corners closer than this to the position are skipped
const MIN_TARGET_DIST: f32 = 0.01;

/// Polygons a visibility or topology shortcut may splice in
const MAX_SHORTCUT_POLYS: usize = 32;

/// Path corridor for smooth path following
#[derive(Debug, Clone)]
pub struct PathCorridor {
    /// Current position in the corridor
    pos: Vec3,
    /// Target position in the corridor
    target: Vec3,
    /// Path polygon references, current polygon first
    path: Vec<PolyRef>,
    max_path: usize,
}

impl PathCorridor {
    /// Creates an empty corridor holding at most `max_path` polygons
    pub fn new(max_path: usize) -> Self {
        Self {
            pos: Vec3::ZERO,
            target: Vec3::ZERO,
            path: Vec::with_capacity(max_path),
            max_path: max_path.max(1),
        }
    }

    /// Collapses the corridor onto a single polygon at `pos`
    pub fn reset(&mut self, poly_ref: PolyRef, pos: Vec3) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        if poly_ref.is_valid() {
            self.path.push(poly_ref);
        }
    }

    /// Loads a new path and target into the corridor
    pub fn set_corridor(&mut self, target: Vec3, polys: &[PolyRef]) {
        self.target = target;
        self.path.clear();
        self.path
            .extend_from_slice(&polys[..polys.len().min(self.max_path)]);
    }

    /// Straight path corners from the position toward the target.
    ///
    /// Corners on top of the position are dropped and the corners stop at
    /// the first off-mesh connection.
    pub fn find_corners(&self, max_corners: usize, query: &NavMeshQuery) -> Result<StraightPath> {
        if self.path.is_empty() || max_corners == 0 {
            return Ok(StraightPath::default());
        }

        let mut corners =
            query.straight_path_along(&self.pos, &self.target, &self.path, max_corners + 1)?;

        let skip = corners
            .points
            .iter()
            .take_while(|c| {
                !c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
                    && dist_sqr_2d(&c.pos, &self.pos) <= sqr(MIN_TARGET_DIST)
            })
            .count();
        corners.points.drain(..skip);

        if let Some(i) = corners
            .points
            .iter()
            .position(|c| c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION))
        {
            corners.points.truncate(i + 1);
        }
        corners.points.truncate(max_corners);

        Ok(corners)
    }

    /// Shortcuts the front of the corridor when `next` is visible from the
    /// current position.
    ///
    /// The ray is cast the full `path_optimization_range`; only a clear ray
    /// merges the shortcut.
    pub fn optimize_path_visibility(
        &mut self,
        next: Vec3,
        path_optimization_range: f32,
        query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        let Some(&first) = self.path.first() else {
            return Ok(());
        };

        let dist = dist_2d(&self.pos, &next);
        if dist < MIN_TARGET_DIST {
            return Ok(());
        }
        let dist = (dist + 0.01).min(path_optimization_range);
        let delta = next - self.pos;
        let goal = self.pos + delta * (path_optimization_range / dist);

        let hit = query.raycast(first, &self.pos, &goal, filter, MAX_SHORTCUT_POLYS)?;
        if hit.path.len() > 1 && hit.t > 0.99 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &hit.path);
        }
        Ok(())
    }

    /// Searches again from the first to the last polygon and splices the
    /// result in when it shortens the corridor.
    ///
    /// Returns whether the corridor changed.
    pub fn optimize_path_topology(
        &mut self,
        query: &mut NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<bool> {
        if self.path.len() < 3 {
            return Ok(false);
        }
        let (first, last) = (self.path[0], self.path[self.path.len() - 1]);

        let found = match query.find_path(first, last, &self.pos, &self.target, filter) {
            Ok(found) => found,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let shortcut = &found.polys[..found.polys.len().min(MAX_SHORTCUT_POLYS)];
        if shortcut.is_empty() {
            return Ok(false);
        }

        let before = self.path.clone();
        merge_corridor_start_shortcut(&mut self.path, self.max_path, shortcut);
        Ok(self.path != before)
    }

    /// Advances the corridor over the off-mesh connection `off_mesh_ref`.
    ///
    /// Returns the polygon the connection was entered from and the
    /// connection's start and end points. The position jumps to the end point.
    pub fn move_over_offmesh_connection(
        &mut self,
        off_mesh_ref: PolyRef,
        nav_mesh: &NavMesh,
    ) -> Result<(PolyRef, Vec3, Vec3)> {
        let Some(idx) = self.path.iter().position(|&r| r == off_mesh_ref) else {
            return Err(Error::NotFound(format!(
                "{off_mesh_ref} is not part of the corridor"
            )));
        };
        if idx + 1 >= self.path.len() {
            return Err(Error::InvalidParam(format!(
                "corridor ends on off-mesh connection {off_mesh_ref}"
            )));
        }
        let prev = if idx > 0 { self.path[idx - 1] } else { PolyRef::NULL };

        let (start, end) = nav_mesh.off_mesh_connection_endpoints(prev, off_mesh_ref)?;
        self.path.drain(..=idx);
        self.pos = end;
        Ok((prev, start, end))
    }

    /// Moves the position along the surface toward `npos`.
    ///
    /// Returns `false` when walls clamped the move short of `npos`.
    pub fn move_position(
        &mut self,
        npos: Vec3,
        query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<bool> {
        let Some(&first) = self.path.first() else {
            return Err(Error::InvalidParam("empty corridor".to_string()));
        };

        let (mut result, visited) = query.move_along_surface(first, &self.pos, &npos, filter)?;
        merge_corridor_start_moved(&mut self.path, self.max_path, &visited);

        // Stay on top of the surface
        if let Some(&current) = self.path.first() {
            if let Ok(h) = query.poly_height(current, &result) {
                result.y = h;
            }
        }
        let reached = dist_sqr_2d(&result, &npos) < sqr(MIN_TARGET_DIST);
        self.pos = result;
        Ok(reached)
    }

    /// Restarts the corridor from a known good polygon and position
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: Vec3) {
        self.pos = safe_pos;
        self.path.clear();
        self.path.push(safe_ref);
    }

    /// Keeps the leading run of valid polygons.
    ///
    /// When even the first polygon is gone the corridor restarts from
    /// `safe_ref`. The target is clamped onto the last kept polygon.
    pub fn trim_invalid_path(
        &mut self,
        safe_ref: PolyRef,
        safe_pos: Vec3,
        nav_mesh: &NavMesh,
        filter: &QueryFilter,
    ) -> Result<()> {
        let n = self
            .path
            .iter()
            .take_while(|&&r| passes_filter(nav_mesh, r, filter))
            .count();
        if n == self.path.len() {
            return Ok(());
        }
        if n == 0 {
            self.pos = safe_pos;
            self.path.clear();
            self.path.push(safe_ref);
        } else {
            self.path.truncate(n);
        }

        if let Some(&last) = self.path.last() {
            self.target = nav_mesh.closest_point_on_poly_boundary(last, &self.target)?;
        }
        Ok(())
    }

    /// Checks the first `max_look_ahead` polygons are still loaded and
    /// pass `filter`
    pub fn is_valid(
        &self,
        max_look_ahead: usize,
        nav_mesh: &NavMesh,
        filter: &QueryFilter,
    ) -> bool {
        self.path
            .iter()
            .take(max_look_ahead)
            .all(|&r| passes_filter(nav_mesh, r, filter))
    }

    pub fn pos(&self) -> Vec3 {
        self.pos
    }

    pub fn target(&self) -> Vec3 {
        self.target
    }

    pub fn path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn path_count(&self) -> usize {
        self.path.len()
    }

    pub fn max_path(&self) -> usize {
        self.max_path
    }

    /// Polygon under the position; null for an empty corridor
    pub fn first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NULL)
    }

    /// Polygon holding the target; null for an empty corridor
    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }
}

fn passes_filter(nav_mesh: &NavMesh, reference: PolyRef, filter: &QueryFilter) -> bool {
    nav_mesh
        .get_tile_and_poly_by_ref(reference)
        .map(|(_, poly)| filter.pass_filter(poly))
        .unwrap_or(false)
}

/// Last polygon of `path` that also appears in `visited`, with its first
/// index in `visited`
fn furthest_common_from_end(path: &[PolyRef], visited: &[PolyRef]) -> Option<(usize, usize)> {
    path.iter()
        .enumerate()
        .rev()
        .find_map(|(i, p)| visited.iter().position(|v| v == p).map(|j| (i, j)))
}

/// Splices the polygons walked by a position move onto the front of `path`.
///
/// `visited` runs from the old first polygon to the one now under the
/// position. Nothing changes when the two share no polygon.
pub fn merge_corridor_start_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    let Some((fp, fv)) = furthest_common_from_end(path, visited) else {
        return;
    };

    // Walked polygons in reverse, current one first
    let mut merged: Vec<PolyRef> = visited[fv..].iter().rev().copied().collect();
    merged.extend_from_slice(&path[(fp + 1).min(path.len())..]);
    merged.truncate(max_path);
    *path = merged;
}

/// Replaces the front of `path` with a shortcut that starts at the same
/// polygon and rejoins the path further on
pub fn merge_corridor_start_shortcut(
    path: &mut Vec<PolyRef>,
    max_path: usize,
    visited: &[PolyRef],
) {
    let Some((fp, fv)) = furthest_common_from_end(path, visited) else {
        return;
    };
    if fv == 0 {
        return;
    }

    let mut merged = visited[..fv].to_vec();
    merged.extend_from_slice(&path[fp..]);
    merged.truncate(max_path);
    *path = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh::grid_mesh;

    fn r(id: u64) -> PolyRef {
        PolyRef::new(id)
    }

    fn refs(ids: &[u64]) -> Vec<PolyRef> {
        ids.iter().map(|&i| r(i)).collect()
    }

    #[test]
    fn test_reset_corridor() {
        let mut corridor = PathCorridor::new(16);
        let start = Vec3::new(10.0, 5.0, 10.0);
        corridor.reset(r(42), start);

        assert_eq!(corridor.pos(), start);
        assert_eq!(corridor.target(), start);
        assert_eq!(corridor.path(), &[r(42)]);

        corridor.reset(PolyRef::NULL, start);
        assert_eq!(corridor.path_count(), 0);
        assert_eq!(corridor.first_poly(), PolyRef::NULL);
    }

    #[test]
    fn test_set_corridor_respects_capacity() {
        let mut corridor = PathCorridor::new(3);
        corridor.set_corridor(Vec3::ONE, &refs(&[1, 2, 3, 4, 5]));
        assert_eq!(corridor.path(), refs(&[1, 2, 3]).as_slice());
        assert_eq!(corridor.last_poly(), r(3));
        assert_eq!(corridor.target(), Vec3::ONE);
    }

    #[test]
    fn test_merge_start_moved_forward() {
        let mut path = refs(&[1, 2, 3, 4]);
        merge_corridor_start_moved(&mut path, 16, &refs(&[1, 2, 3]));
        assert_eq!(path, refs(&[3, 4]));
    }

    #[test]
    fn test_merge_start_moved_off_path() {
        // Stepped sideways from 2 into 9
        let mut path = refs(&[1, 2, 3, 4]);
        merge_corridor_start_moved(&mut path, 16, &refs(&[1, 2, 9]));
        assert_eq!(path, refs(&[9, 2, 3, 4]));

        let mut path = refs(&[1, 2]);
        merge_corridor_start_moved(&mut path, 16, &refs(&[7, 8]));
        assert_eq!(path, refs(&[1, 2]));
    }

    #[test]
    fn test_merge_start_shortcut() {
        let mut path = refs(&[1, 2, 3, 4, 5]);
        merge_corridor_start_shortcut(&mut path, 16, &refs(&[1, 7, 4]));
        assert_eq!(path, refs(&[1, 7, 4, 5]));

        // Shortcut that rejoins at the start changes nothing
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_start_shortcut(&mut path, 16, &refs(&[1]));
        assert_eq!(path, refs(&[1, 2, 3]));
    }

    #[test]
    fn test_move_position_follows_surface() -> Result<()> {
        let mesh = grid_mesh(4)?;
        let query = NavMeshQuery::new(&mesh, 256)?;
        let filter = QueryFilter::default();

        let start = Vec3::new(0.5, 0.0, 0.5);
        let target = Vec3::new(3.5, 0.0, 0.5);
        let corridor_polys: Vec<PolyRef> = (0..4).map(|i| mesh.encode_poly_ref(0, i)).collect();
        let mut corridor = PathCorridor::new(32);
        corridor.reset(corridor_polys[0], start);
        corridor.set_corridor(target, &corridor_polys);

        assert!(corridor.move_position(Vec3::new(1.5, 0.0, 0.5), &query, &filter)?);
        assert_eq!(corridor.first_poly(), corridor_polys[1]);
        assert_eq!(corridor.path(), &corridor_polys[1..]);

        // Walking off the mesh is clamped at the boundary
        assert!(!corridor.move_position(Vec3::new(1.5, 0.0, -2.0), &query, &filter)?);
        assert!(corridor.pos().z.abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_find_corners_skips_current_position() -> Result<()> {
        let mesh = grid_mesh(4)?;
        let query = NavMeshQuery::new(&mesh, 256)?;
        let start = Vec3::new(0.5, 0.0, 0.5);
        let target = Vec3::new(3.5, 0.0, 0.5);
        let polys: Vec<PolyRef> = (0..4).map(|i| mesh.encode_poly_ref(0, i)).collect();

        let mut corridor = PathCorridor::new(32);
        corridor.reset(polys[0], start);
        corridor.set_corridor(target, &polys);

        let corners = corridor.find_corners(4, &query)?;
        assert_eq!(corners.len(), 1);
        assert!(corners.points[0].pos.distance(target) < 1e-3);
        assert!(corners.points[0].flags.contains(StraightPathFlags::END));
        Ok(())
    }

    #[test]
    fn test_trim_invalid_path_restarts_from_safe_poly() -> Result<()> {
        let mesh = grid_mesh(2)?;
        let filter = QueryFilter::default();
        let safe = mesh.encode_poly_ref(0, 0);
        let stale = PolyRef::new(0xdead_beef);

        let mut corridor = PathCorridor::new(8);
        corridor.set_corridor(Vec3::new(1.5, 0.0, 0.5), &[stale, safe]);
        assert!(!corridor.is_valid(4, &mesh, &filter));

        corridor.trim_invalid_path(safe, Vec3::new(0.5, 0.0, 0.5), &mesh, &filter)?;
        assert_eq!(corridor.path(), &[safe]);
        assert!(corridor.is_valid(4, &mesh, &filter));
        // Target clamped into the remaining polygon
        assert!(corridor.target().x <= 1.0 + 1e-4);
        Ok(())
    }

    #[test]
    fn test_visibility_shortcut() -> Result<()> {
        let mesh = grid_mesh(4)?;
        let query = NavMeshQuery::new(&mesh, 256)?;
        let filter = QueryFilter::default();
        let p = |i| mesh.encode_poly_ref(0, i);

        // Loops through the second row: 0 -> 4 -> 5 -> 6 -> 2 -> 3
        let start = Vec3::new(0.5, 0.0, 0.5);
        let target = Vec3::new(3.5, 0.0, 0.5);
        let mut corridor = PathCorridor::new(32);
        corridor.reset(p(0), start);
        corridor.set_corridor(target, &[p(0), p(4), p(5), p(6), p(2), p(3)]);

        // The ray is stretched to the full range, so keep it on the mesh
        corridor.optimize_path_visibility(target, 3.0, &query, &filter)?;
        assert_eq!(corridor.path(), &[p(0), p(1), p(2), p(3)]);
        Ok(())
    }
}
