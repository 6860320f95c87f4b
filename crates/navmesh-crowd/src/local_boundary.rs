//! Wall segments around an agent, cached between ticks

use glam::Vec3;

use nav_common::{dist_pt_seg_sqr_2d, sqr, Result};
use navmesh::{NavMeshQuery, PolyRef, QueryFilter};

pub const MAX_LOCAL_SEGS: usize = 8;
pub const MAX_LOCAL_POLYS: usize = 16;

/// Wall segment with its squared distance to the boundary center
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundarySegment {
    pub p: Vec3,
    pub q: Vec3,
    pub dist_sqr: f32,
}

#[derive(Debug, Clone, Default)]
pub struct LocalBoundary {
    center: Option<Vec3>,
    segs: Vec<BoundarySegment>,
    polys: Vec<PolyRef>,
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self {
            center: None,
            segs: Vec::with_capacity(MAX_LOCAL_SEGS),
            polys: Vec::with_capacity(MAX_LOCAL_POLYS),
        }
    }

    pub fn reset(&mut self) {
        self.center = None;
        self.segs.clear();
        self.polys.clear();
    }

    /// Collects the walls within `collision_query_range` of `pos`, walking
    /// out from `poly_ref`
    pub fn update(
        &mut self,
        poly_ref: PolyRef,
        pos: Vec3,
        collision_query_range: f32,
        query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        self.reset();
        if !poly_ref.is_valid() {
            return Ok(());
        }
        self.center = Some(pos);

        let neighbourhood = query.find_local_neighbourhood(
            poly_ref,
            &pos,
            collision_query_range,
            filter,
            MAX_LOCAL_POLYS,
        )?;
        self.polys.extend(neighbourhood.iter().map(|&(r, _)| r));

        let range_sqr = sqr(collision_query_range);
        for &r in &self.polys {
            for [p, q] in query.poly_wall_segments(r, filter)? {
                let (dist_sqr, _) = dist_pt_seg_sqr_2d(&pos, &p, &q);
                if dist_sqr > range_sqr {
                    continue;
                }
                insert_segment(&mut self.segs, BoundarySegment { p, q, dist_sqr });
            }
        }
        Ok(())
    }

    /// Whether every polygon the walls were collected from is still usable
    pub fn is_valid(&self, query: &NavMeshQuery, filter: &QueryFilter) -> bool {
        if self.polys.is_empty() {
            return false;
        }
        let nav_mesh = query.nav_mesh();
        self.polys.iter().all(|&r| {
            nav_mesh
                .get_tile_and_poly_by_ref(r)
                .map(|(_, poly)| filter.pass_filter(poly))
                .unwrap_or(false)
        })
    }

    /// Position of the last update; `None` before the first one
    pub fn center(&self) -> Option<Vec3> {
        self.center
    }

    /// Walls nearest first
    pub fn segments(&self) -> &[BoundarySegment] {
        &self.segs
    }

    pub fn polys(&self) -> &[PolyRef] {
        &self.polys
    }
}

/// Keeps the closest `MAX_LOCAL_SEGS` segments, ordered by distance
fn insert_segment(segs: &mut Vec<BoundarySegment>, seg: BoundarySegment) {
    let at = segs.partition_point(|s| s.dist_sqr <= seg.dist_sqr);
    if at >= MAX_LOCAL_SEGS {
        return;
    }
    segs.insert(at, seg);
    segs.truncate(MAX_LOCAL_SEGS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh::{corridor_mesh, grid_mesh};

    #[test]
    fn test_segments_sorted_and_capped() {
        let mut segs = Vec::new();
        for d in [5.0, 1.0, 3.0, 9.0, 0.5, 7.0, 2.0, 8.0, 4.0, 6.0] {
            insert_segment(
                &mut segs,
                BoundarySegment {
                    p: Vec3::ZERO,
                    q: Vec3::X,
                    dist_sqr: d,
                },
            );
        }
        let dists: Vec<f32> = segs.iter().map(|s| s.dist_sqr).collect();
        assert_eq!(dists, vec![0.5, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_update_collects_nearby_walls() -> Result<()> {
        let mesh = corridor_mesh(6)?;
        let query = NavMeshQuery::new(&mesh, 256)?;
        let filter = QueryFilter::default();

        let mut boundary = LocalBoundary::new();
        assert!(!boundary.is_valid(&query, &filter));

        let pos = Vec3::new(0.5, 0.0, 0.5);
        boundary.update(mesh.encode_poly_ref(0, 0), pos, 1.2, &query, &filter)?;
        assert_eq!(boundary.center(), Some(pos));
        assert!(boundary.is_valid(&query, &filter));

        let segs = boundary.segments();
        assert!(!segs.is_empty());
        assert!(segs.iter().all(|s| s.dist_sqr <= sqr(1.2)));
        assert!(segs.windows(2).all(|w| w[0].dist_sqr <= w[1].dist_sqr));
        // The closest walls are the corridor sides and the west end
        assert!((segs[0].dist_sqr - 0.25).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_open_floor_has_no_walls() -> Result<()> {
        let mesh = grid_mesh(8)?;
        let query = NavMeshQuery::new(&mesh, 256)?;
        let filter = QueryFilter::default();

        let mut boundary = LocalBoundary::new();
        let poly_ref = mesh.encode_poly_ref(0, 27);
        boundary.update(poly_ref, Vec3::new(3.5, 0.0, 3.5), 1.0, &query, &filter)?;
        assert!(boundary.segments().is_empty());
        assert!(boundary.is_valid(&query, &filter));

        boundary.reset();
        assert_eq!(boundary.center(), None);
        assert!(!boundary.is_valid(&query, &filter));
        Ok(())
    }
}
