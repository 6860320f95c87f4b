//! Navigation mesh query implementation
//!
//! This module contains the NavMeshQuery structure, which is used to perform
//! pathfinding and other spatial queries on the navigation mesh. A query
//! borrows the mesh and owns a fixed-size node pool, so the work done by a
//! single search is bounded by the pool size chosen at creation time.

use std::collections::{HashSet, VecDeque};

use glam::Vec3;
use log::{debug, trace};

use super::nav_mesh::{MeshTile, Poly, EXT_LINK, LINK_SIDE_INTERNAL};
use super::node_pool::{NodeFlags, NodePool, NodeQueue};
use super::raycast_hit::RaycastHit;
use super::settings::NavQuerySettings;
use super::{NavMesh, PolyRef, QueryFilter};
use nav_common::{
    dist_pt_seg_sqr_2d, intersect_segment_poly_2d, overlap_poly_poly_2d, point_in_polygon_2d,
    poly_area_2d, random_point_in_convex_poly, sqr, tri_area_2d, vequal, Error, Result,
};

/// Largest node budget a query accepts
pub const MAX_QUERY_NODES: usize = 65535;

/// Weight applied to the A* heuristic
const H_SCALE: f32 = 0.999;

/// Polygons visited at most by a surface move
const MAX_SURFACE_VISITED: usize = 16;

/// Breadth of the surface move search queue
const MAX_SURFACE_STACK: usize = 48;

/// Neighbours considered per edge during a surface move
const MAX_EDGE_NEIS: usize = 8;

bitflags::bitflags! {
    /// Flags attached to straight path points
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct StraightPathFlags: u8 {
        /// The point is the start position of the path
        const START = 0x01;
        /// The point is the end position of the path
        const END = 0x02;
        /// The point is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

/// Polygon corridor found by [`NavMeshQuery::find_path`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolyPath {
    pub polys: Vec<PolyRef>,
    /// The goal was not reached; the path leads as close as the search got
    pub partial: bool,
}

impl PolyPath {
    pub fn last(&self) -> Option<PolyRef> {
        self.polys.last().copied()
    }
}

/// One point of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub pos: Vec3,
    pub flags: StraightPathFlags,
    /// Polygon entered at this point
    pub poly: PolyRef,
}

/// Waypoints through a polygon corridor
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StraightPath {
    pub points: Vec<StraightPathPoint>,
    /// The corridor was partial or the point budget cut the path short
    pub partial: bool,
}

impl StraightPath {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn positions(&self) -> Vec<Vec3> {
        self.points.iter().map(|p| p.pos).collect()
    }
}

enum Append {
    InProgress,
    Done,
    Full,
}

fn append_vertex(
    points: &mut Vec<StraightPathPoint>,
    max_points: usize,
    pos: Vec3,
    flags: StraightPathFlags,
    poly: PolyRef,
) -> Append {
    if let Some(last) = points.last_mut() {
        if vequal(&last.pos, &pos) {
            last.flags = flags;
            last.poly = poly;
            return Append::InProgress;
        }
    }
    points.push(StraightPathPoint { pos, flags, poly });
    if flags.contains(StraightPathFlags::END) {
        Append::Done
    } else if points.len() >= max_points {
        Append::Full
    } else {
        Append::InProgress
    }
}

/// Navigation mesh query structure
#[derive(Debug)]
pub struct NavMeshQuery<'a> {
    /// Reference to the navigation mesh
    nav_mesh: &'a NavMesh,
    /// Node pool for A* search
    node_pool: NodePool,
    /// Open list for A* search
    open_list: NodeQueue,
    /// Random seed for random sample queries
    random_seed: u32,
    valid: bool,
}

impl<'a> NavMeshQuery<'a> {
    /// Creates a query over `nav_mesh` with a budget of `max_nodes` search nodes
    pub fn new(nav_mesh: &'a NavMesh, max_nodes: usize) -> Result<Self> {
        if max_nodes == 0 || max_nodes > MAX_QUERY_NODES {
            return Err(Error::InvalidParam(format!(
                "max nodes must be in 1..={MAX_QUERY_NODES}, got {max_nodes}"
            )));
        }
        Ok(Self {
            nav_mesh,
            node_pool: NodePool::new(max_nodes),
            open_list: NodeQueue::new(),
            random_seed: 1,
            valid: true,
        })
    }

    /// Whether the query can still be used
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Retires the query; every later call fails with `InvalidHandle`
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    fn check_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(Error::InvalidHandle("query has been invalidated".to_string()))
        }
    }

    /// Gets a reference to the navigation mesh
    pub fn nav_mesh(&self) -> &'a NavMesh {
        self.nav_mesh
    }

    pub fn max_nodes(&self) -> usize {
        self.node_pool.max_nodes()
    }

    /// Sets the random seed for random point generation
    pub fn set_random_seed(&mut self, seed: u32) {
        self.random_seed = seed;
    }

    /// Generates next random number (simple LCG)
    fn next_random(&mut self) -> u32 {
        self.random_seed = self
            .random_seed
            .wrapping_mul(1103515245)
            .wrapping_add(12345);
        self.random_seed
    }

    /// Generates a random float in [0, 1]
    fn random_f32(&mut self) -> f32 {
        (self.next_random() & 0x7FFF_FFFF) as f32 / 2_147_483_647.0
    }

    /// Finds the polygon nearest to `center` within `center ± half_extents`
    pub fn find_nearest_poly(
        &self,
        center: &Vec3,
        half_extents: &Vec3,
        filter: &QueryFilter,
    ) -> Result<(PolyRef, Vec3)> {
        self.check_valid()?;
        let bmin = *center - *half_extents;
        let bmax = *center + *half_extents;

        let mut best: Option<(PolyRef, Vec3, f32)> = None;
        for reference in self.nav_mesh.query_polygons(&bmin, &bmax, filter) {
            let (tile, idx) = self.nav_mesh.get_tile_and_poly_index(reference)?;
            let (closest, d) = tile.nearest_point_score(idx, center);
            if best.map_or(true, |(_, _, bd)| d < bd) {
                best = Some((reference, closest, d));
            }
        }
        best.map(|(r, p, _)| (r, p))
            .ok_or_else(|| Error::NotFound(format!("no polygon within {half_extents} of {center}")))
    }

    /// Closest point on the mesh surface near `point`
    pub fn sample_position(
        &self,
        point: &Vec3,
        extents: &Vec3,
        filter: &QueryFilter,
    ) -> Result<Vec3> {
        self.find_nearest_poly(point, extents, filter).map(|(_, p)| p)
    }

    /// `point`'s x/z with the height of the polygon directly below or above
    /// it, choosing the surface closest in height
    pub fn get_location(&self, point: &Vec3, extents: &Vec3, filter: &QueryFilter) -> Result<Vec3> {
        self.check_valid()?;
        let bmin = *point - *extents;
        let bmax = *point + *extents;

        let mut best: Option<f32> = None;
        for reference in self.nav_mesh.query_polygons(&bmin, &bmax, filter) {
            let (tile, idx) = self.nav_mesh.get_tile_and_poly_index(reference)?;
            if let Some(h) = tile.poly_height(idx, point) {
                if best.map_or(true, |b| (h - point.y).abs() < (b - point.y).abs()) {
                    best = Some(h);
                }
            }
        }
        best.map(|h| Vec3::new(point.x, h, point.z))
            .ok_or_else(|| Error::NotFound(format!("no surface under {point}")))
    }

    pub fn closest_point_on_poly(&self, poly_ref: PolyRef, pos: &Vec3) -> Result<(Vec3, bool)> {
        self.check_valid()?;
        self.nav_mesh.closest_point_on_poly(poly_ref, pos)
    }

    pub fn closest_point_on_poly_boundary(&self, poly_ref: PolyRef, pos: &Vec3) -> Result<Vec3> {
        self.check_valid()?;
        self.nav_mesh.closest_point_on_poly_boundary(poly_ref, pos)
    }

    /// Surface height of a polygon at `pos`
    pub fn poly_height(&self, poly_ref: PolyRef, pos: &Vec3) -> Result<f32> {
        self.check_valid()?;
        self.nav_mesh
            .poly_height(poly_ref, pos)
            .ok_or_else(|| Error::NotFound(format!("{pos} is not over {poly_ref}")))
    }

    /// Left and right end points of the portal from one polygon to the next
    pub fn get_portal_points(&self, from: PolyRef, to: PolyRef) -> Result<(Vec3, Vec3)> {
        let (from_tile, from_poly) = self.nav_mesh.get_tile_and_poly_by_ref(from)?;
        let (to_tile, to_poly) = self.nav_mesh.get_tile_and_poly_by_ref(to)?;
        portal_points(from_tile, from_poly, to, to_tile, to_poly, from)
    }

    /// Finds a polygon corridor from `start_ref` to `end_ref` with A*.
    ///
    /// Fails with `NotFound` when the goal is unreachable. When the node
    /// budget runs out first the path to the most promising node is
    /// returned with `partial` set.
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &Vec3,
        end_pos: &Vec3,
        filter: &QueryFilter,
    ) -> Result<PolyPath> {
        self.check_valid()?;
        let nav_mesh = self.nav_mesh;
        if !nav_mesh.is_valid_poly_ref(start_ref) || !nav_mesh.is_valid_poly_ref(end_ref) {
            return Err(Error::NotFound(format!(
                "path endpoints {start_ref} -> {end_ref} are not loaded"
            )));
        }

        if start_ref == end_ref {
            return Ok(PolyPath {
                polys: vec![start_ref],
                partial: false,
            });
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self
            .node_pool
            .get_node(start_ref)
            .ok_or_else(|| Error::Detour("node pool is empty".to_string()))?;
        {
            let start = self.node_pool.node_mut(start_idx);
            start.pos = *start_pos;
            start.parent = None;
            start.cost = 0.0;
            start.total = start_pos.distance(*end_pos) * H_SCALE;
            start.flags = NodeFlags::OPEN;
        }
        self.open_list.push(&self.node_pool, start_idx);

        let mut last_best = start_idx;
        let mut last_best_cost = self.node_pool.node(start_idx).total;
        let mut out_of_nodes = false;
        let mut reached = false;

        while let Some(best_idx) = self.open_list.pop(&self.node_pool) {
            let (best_ref, best_pos, best_cost, parent_ref) = {
                let node = self.node_pool.node_mut(best_idx);
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
                (node.id, node.pos, node.cost, node.parent)
            };
            let parent_ref = parent_ref.map(|p| self.node_pool.node(p).id);

            if best_ref == end_ref {
                last_best = best_idx;
                reached = true;
                break;
            }

            let (best_tile, best_poly) = nav_mesh.get_tile_and_poly_by_ref(best_ref)?;
            for link in best_tile.links_of(best_poly) {
                let neighbour_ref = link.reference;
                if neighbour_ref.is_null() || Some(neighbour_ref) == parent_ref {
                    continue;
                }
                let Ok((neighbour_tile, neighbour_poly)) =
                    nav_mesh.get_tile_and_poly_by_ref(neighbour_ref)
                else {
                    continue;
                };
                if !filter.pass_filter(neighbour_poly) {
                    continue;
                }

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref) else {
                    out_of_nodes = true;
                    continue;
                };

                // First visit: the node sits on the middle of the portal
                if self.node_pool.node(neighbour_idx).flags.is_empty() {
                    let (left, right) = portal_points(
                        best_tile,
                        best_poly,
                        neighbour_ref,
                        neighbour_tile,
                        neighbour_poly,
                        best_ref,
                    )?;
                    self.node_pool.node_mut(neighbour_idx).pos = (left + right) * 0.5;
                }
                let neighbour_pos = self.node_pool.node(neighbour_idx).pos;

                let (cost, heuristic) = if neighbour_ref == end_ref {
                    let cur_cost = filter.cost(best_pos, neighbour_pos, best_poly);
                    let end_cost = filter.cost(neighbour_pos, *end_pos, neighbour_poly);
                    (best_cost + cur_cost + end_cost, 0.0)
                } else {
                    let cur_cost = filter.cost(best_pos, neighbour_pos, best_poly);
                    (
                        best_cost + cur_cost,
                        neighbour_pos.distance(*end_pos) * H_SCALE,
                    )
                };
                let total = cost + heuristic;

                let node = self.node_pool.node_mut(neighbour_idx);
                if node.flags.intersects(NodeFlags::OPEN | NodeFlags::CLOSED)
                    && total >= node.total
                {
                    continue;
                }
                node.parent = Some(best_idx);
                node.cost = cost;
                node.total = total;
                node.flags = NodeFlags::OPEN;
                self.open_list.push(&self.node_pool, neighbour_idx);
                trace!("open {neighbour_ref} cost {cost:.3} total {total:.3}");

                if heuristic < last_best_cost {
                    last_best_cost = heuristic;
                    last_best = neighbour_idx;
                }
            }
        }

        if !reached && !out_of_nodes {
            return Err(Error::NotFound(format!(
                "no path from {start_ref} to {end_ref}"
            )));
        }
        if out_of_nodes && !reached {
            debug!(
                "path search ran out of its {} nodes; returning partial path",
                self.node_pool.max_nodes()
            );
        }

        let mut polys = Vec::new();
        let mut cur = Some(last_best);
        while let Some(idx) = cur {
            let node = self.node_pool.node(idx);
            polys.push(node.id);
            cur = node.parent;
        }
        polys.reverse();

        Ok(PolyPath {
            partial: polys.last() != Some(&end_ref),
            polys,
        })
    }

    /// Whether `end_ref` can be reached from `start_ref`
    pub fn has_path_between(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &Vec3,
        end_pos: &Vec3,
        filter: &QueryFilter,
    ) -> bool {
        self.find_path(start_ref, end_ref, start_pos, end_pos, filter)
            .map(|path| !path.partial)
            .unwrap_or(false)
    }

    /// Whether `target` can be reached from `source`, snapping both points
    /// to the mesh first
    pub fn has_path(
        &mut self,
        source: &Vec3,
        target: &Vec3,
        settings: &NavQuerySettings,
        filter: &QueryFilter,
    ) -> bool {
        let extent = settings.find_nearest_poly_extent;
        let Ok((start_ref, start_pos)) = self.find_nearest_poly(source, &extent, filter) else {
            return false;
        };
        let Ok((end_ref, end_pos)) = self.find_nearest_poly(target, &extent, filter) else {
            return false;
        };
        self.has_path_between(start_ref, end_ref, &start_pos, &end_pos, filter)
    }

    /// Finds a corridor and pulls it into a straight path
    pub fn find_straight_path(
        &mut self,
        start_ref: PolyRef,
        start_pos: &Vec3,
        end_ref: PolyRef,
        end_pos: &Vec3,
        filter: &QueryFilter,
        max_points: usize,
    ) -> Result<StraightPath> {
        let path = self.find_path(start_ref, end_ref, start_pos, end_pos, filter)?;
        let mut straight = self.straight_path_along(start_pos, end_pos, &path.polys, max_points)?;
        straight.partial |= path.partial;
        Ok(straight)
    }

    /// Straight path between two world positions
    pub fn find_straight_path_between(
        &mut self,
        source: &Vec3,
        target: &Vec3,
        settings: &NavQuerySettings,
        filter: &QueryFilter,
    ) -> Result<StraightPath> {
        let extent = settings.find_nearest_poly_extent;
        let (start_ref, start_pos) = self.find_nearest_poly(source, &extent, filter)?;
        let (end_ref, end_pos) = self.find_nearest_poly(target, &extent, filter)?;
        self.find_straight_path(
            start_ref,
            &start_pos,
            end_ref,
            &end_pos,
            filter,
            settings.max_path_points,
        )
    }

    /// Funnels the corridor `path` into waypoints from `start_pos` to `end_pos`
    pub fn straight_path_along(
        &self,
        start_pos: &Vec3,
        end_pos: &Vec3,
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<StraightPath> {
        self.check_valid()?;
        let (Some(&first), Some(&last)) = (path.first(), path.last()) else {
            return Err(Error::InvalidParam("empty corridor".to_string()));
        };
        if max_points == 0 {
            return Err(Error::InvalidParam("max points must be positive".to_string()));
        }

        let nav_mesh = self.nav_mesh;
        let closest_start = nav_mesh.closest_point_on_poly_boundary(first, start_pos)?;
        let mut closest_end = nav_mesh.closest_point_on_poly_boundary(last, end_pos)?;

        let mut points = Vec::new();
        let full = |points: Vec<StraightPathPoint>| StraightPath {
            points,
            partial: true,
        };

        if let Append::Full = append_vertex(
            &mut points,
            max_points,
            closest_start,
            StraightPathFlags::START,
            first,
        ) {
            return Ok(full(points));
        }

        if path.len() > 1 {
            let mut portal_apex = closest_start;
            let mut portal_left = portal_apex;
            let mut portal_right = portal_apex;
            let mut left_index = 0usize;
            let mut right_index = 0usize;
            let mut left_poly = first;
            let mut right_poly = first;
            let mut left_off_mesh = false;
            let mut right_off_mesh = false;

            let mut i = 0usize;
            while i < path.len() {
                let (left, right, to_off_mesh) = if i + 1 < path.len() {
                    match self.get_portal_points(path[i], path[i + 1]) {
                        Ok((left, right)) => {
                            // Starting right on the portal; move on
                            if i == 0 {
                                let (d, _) = dist_pt_seg_sqr_2d(&portal_apex, &left, &right);
                                if d < sqr(0.001) {
                                    i += 1;
                                    continue;
                                }
                            }
                            let off_mesh = nav_mesh
                                .get_tile_and_poly_by_ref(path[i + 1])
                                .map(|(_, p)| p.is_off_mesh())
                                .unwrap_or(false);
                            (left, right, off_mesh)
                        }
                        Err(_) => {
                            // The corridor breaks here; end on the last good polygon
                            closest_end =
                                nav_mesh.closest_point_on_poly_boundary(path[i], end_pos)?;
                            append_vertex(
                                &mut points,
                                max_points,
                                closest_end,
                                StraightPathFlags::END,
                                path[i],
                            );
                            return Ok(full(points));
                        }
                    }
                } else {
                    (closest_end, closest_end, false)
                };
                let next_poly = path.get(i + 1).copied().unwrap_or(last);

                // Right vertex
                if tri_area_2d(&portal_apex, &portal_right, &right) <= 0.0 {
                    if vequal(&portal_apex, &portal_right)
                        || tri_area_2d(&portal_apex, &portal_left, &right) > 0.0
                    {
                        portal_right = right;
                        right_poly = next_poly;
                        right_off_mesh = to_off_mesh;
                        right_index = i;
                    } else {
                        portal_apex = portal_left;
                        let apex_index = left_index;
                        let flags = if left_off_mesh {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        if let Append::Full =
                            append_vertex(&mut points, max_points, portal_apex, flags, left_poly)
                        {
                            return Ok(full(points));
                        }
                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left vertex
                if tri_area_2d(&portal_apex, &portal_left, &left) >= 0.0 {
                    if vequal(&portal_apex, &portal_left)
                        || tri_area_2d(&portal_apex, &portal_right, &left) < 0.0
                    {
                        portal_left = left;
                        left_poly = next_poly;
                        left_off_mesh = to_off_mesh;
                        left_index = i;
                    } else {
                        portal_apex = portal_right;
                        let apex_index = right_index;
                        let flags = if right_off_mesh {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        if let Append::Full =
                            append_vertex(&mut points, max_points, portal_apex, flags, right_poly)
                        {
                            return Ok(full(points));
                        }
                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }
        }

        append_vertex(&mut points, max_points, closest_end, StraightPathFlags::END, last);
        Ok(StraightPath {
            points,
            partial: false,
        })
    }

    /// Casts a ray along the surface from `start_pos` towards `end_pos`.
    ///
    /// Walks polygon to polygon until the end point is reached or an edge
    /// without a passable neighbour blocks the way; leaving the mesh counts
    /// as a hit. At most `max_path` visited polygons are recorded.
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: &Vec3,
        end_pos: &Vec3,
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<RaycastHit> {
        self.check_valid()?;
        let nav_mesh = self.nav_mesh;
        if !nav_mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::NotFound(format!("raycast start {start_ref} is not loaded")));
        }

        let mut path = Vec::new();
        let mut partial = false;
        let mut t = 0.0f32;
        let mut cur_ref = start_ref;

        // Each step moves strictly forward along the ray, so a polygon is
        // entered at most once; the bound guards against bad data.
        for _ in 0..=self.node_pool.max_nodes() {
            let (tile, poly) = nav_mesh.get_tile_and_poly_by_ref(cur_ref)?;
            let verts = tile.poly_verts(poly);
            let Some(seg) = intersect_segment_poly_2d(start_pos, end_pos, &verts) else {
                // The start is not on the polygon
                return Ok(RaycastHit {
                    t,
                    hit_normal: Vec3::ZERO,
                    hit_edge_index: None,
                    path,
                    partial,
                });
            };
            t = t.max(seg.tmax);

            if path.len() < max_path {
                path.push(cur_ref);
            } else {
                partial = true;
            }

            let Some(edge) = seg.seg_max else {
                let mut hit = RaycastHit::no_hit(path);
                hit.partial = partial;
                return Ok(hit);
            };

            let nv = verts.len();
            let v0 = verts[edge];
            let v1 = verts[(edge + 1) % nv];
            let mut next_ref = None;
            for link in tile.links_of(poly) {
                if link.edge as usize != edge {
                    continue;
                }
                let Ok((_, next_poly)) = nav_mesh.get_tile_and_poly_by_ref(link.reference) else {
                    continue;
                };
                if next_poly.is_off_mesh() || !filter.pass_filter(next_poly) {
                    continue;
                }
                if link.side == LINK_SIDE_INTERNAL || (link.bmin == 0 && link.bmax == 255) {
                    next_ref = Some(link.reference);
                    break;
                }

                // The link covers only part of the edge; check where the ray crosses
                let s = 1.0 / 255.0;
                let (a, b, cross) = if link.side == 0 || link.side == 4 {
                    (v0.z, v1.z, start_pos.z + (end_pos.z - start_pos.z) * seg.tmax)
                } else {
                    (v0.x, v1.x, start_pos.x + (end_pos.x - start_pos.x) * seg.tmax)
                };
                let mut lmin = a + (b - a) * (f32::from(link.bmin) * s);
                let mut lmax = a + (b - a) * (f32::from(link.bmax) * s);
                if lmin > lmax {
                    std::mem::swap(&mut lmin, &mut lmax);
                }
                if cross >= lmin && cross <= lmax {
                    next_ref = Some(link.reference);
                    break;
                }
            }

            match next_ref {
                Some(next) => cur_ref = next,
                None => {
                    let dx = v1.x - v0.x;
                    let dz = v1.z - v0.z;
                    let normal = Vec3::new(dz, 0.0, -dx).normalize_or_zero();
                    let mut hit = RaycastHit::wall_hit(t, normal, edge, path);
                    hit.partial = partial;
                    return Ok(hit);
                }
            }
        }

        Err(Error::Detour("raycast did not terminate".to_string()))
    }

    /// Raycast between two world positions, snapping the start to the mesh
    pub fn raycast_between(
        &self,
        source: &Vec3,
        target: &Vec3,
        settings: &NavQuerySettings,
        filter: &QueryFilter,
    ) -> Result<RaycastHit> {
        let (start_ref, start_pos) =
            self.find_nearest_poly(source, &settings.find_nearest_poly_extent, filter)?;
        self.raycast(start_ref, &start_pos, target, filter, settings.max_path_points)
    }

    /// Random point on the mesh; polygons are chosen in proportion to area
    pub fn get_random_position(&mut self, filter: &QueryFilter) -> Result<(PolyRef, Vec3)> {
        self.check_valid()?;
        let nav_mesh = self.nav_mesh;

        let mut chosen: Option<(&MeshTile, usize, PolyRef)> = None;
        let mut area_sum = 0.0f32;
        for (tile_idx, tile) in nav_mesh.tiles() {
            for (i, poly) in tile.polys.iter().enumerate() {
                if poly.is_off_mesh() || !filter.pass_filter(poly) {
                    continue;
                }
                let area = poly_area_2d(&tile.poly_verts(poly));
                area_sum += area;
                // Reservoir sampling weighted by area
                let u = self.random_f32();
                if u * area_sum <= area {
                    chosen = Some((tile, i, nav_mesh.encode_poly_ref(tile_idx, i)));
                }
            }
        }

        let Some((tile, poly_idx, reference)) = chosen else {
            return Err(Error::NotFound("no polygon passes the filter".to_string()));
        };
        let verts = tile.poly_verts(&tile.polys[poly_idx]);
        let s = self.random_f32();
        let t = self.random_f32();
        let mut pt = random_point_in_convex_poly(&verts, s, t);
        if let Some(h) = tile.poly_height(poly_idx, &pt) {
            pt.y = h;
        }
        Ok((reference, pt))
    }

    /// Moves from `start_pos` towards `end_pos` staying on the surface.
    ///
    /// Returns the reached position and the polygons crossed to get there.
    /// The position is clamped to the nearest wall when the target is not
    /// reachable in a straight line.
    pub fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: &Vec3,
        end_pos: &Vec3,
        filter: &QueryFilter,
    ) -> Result<(Vec3, Vec<PolyRef>)> {
        self.check_valid()?;
        let nav_mesh = self.nav_mesh;
        if !nav_mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::NotFound(format!("surface move start {start_ref} is not loaded")));
        }

        struct SurfaceNode {
            poly_ref: PolyRef,
            parent: Option<usize>,
        }

        let mut nodes = vec![SurfaceNode {
            poly_ref: start_ref,
            parent: None,
        }];
        let mut visited: HashSet<PolyRef> = HashSet::from([start_ref]);
        let mut stack = VecDeque::from([0usize]);

        let mut best_pos = *start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = 0usize;

        // Search constraints
        let search_pos = start_pos.lerp(*end_pos, 0.5);
        let search_rad_sqr = sqr(start_pos.distance(*end_pos) * 0.5 + 0.001);

        while let Some(cur) = stack.pop_front() {
            let (tile, poly) = nav_mesh.get_tile_and_poly_by_ref(nodes[cur].poly_ref)?;
            let verts = tile.poly_verts(poly);

            if point_in_polygon_2d(end_pos, &verts) {
                best_node = cur;
                best_pos = *end_pos;
                break;
            }

            let nv = verts.len();
            for j in 0..nv {
                let vj = verts[j];
                let vi = verts[(j + 1) % nv];

                let neis: Vec<PolyRef> = if poly.neis[j] == 0 {
                    Vec::new()
                } else {
                    tile.links_of(poly)
                        .filter(|l| l.edge as usize == j)
                        .filter(|l| {
                            nav_mesh
                                .get_tile_and_poly_by_ref(l.reference)
                                .map(|(_, p)| filter.pass_filter(p))
                                .unwrap_or(false)
                        })
                        .map(|l| l.reference)
                        .take(MAX_EDGE_NEIS)
                        .collect()
                };

                if neis.is_empty() {
                    // Wall edge
                    let (d, tseg) = dist_pt_seg_sqr_2d(end_pos, &vj, &vi);
                    if d < best_dist {
                        best_pos = vj.lerp(vi, tseg);
                        best_dist = d;
                        best_node = cur;
                    }
                    continue;
                }

                for nei in neis {
                    if visited.contains(&nei) {
                        continue;
                    }
                    let (d, _) = dist_pt_seg_sqr_2d(&search_pos, &vj, &vi);
                    if d > search_rad_sqr {
                        continue;
                    }
                    if nodes.len() >= MAX_SURFACE_VISITED {
                        continue;
                    }
                    visited.insert(nei);
                    nodes.push(SurfaceNode {
                        poly_ref: nei,
                        parent: Some(cur),
                    });
                    if stack.len() < MAX_SURFACE_STACK {
                        stack.push_back(nodes.len() - 1);
                    }
                }
            }
        }

        let mut path = Vec::new();
        let mut cur = Some(best_node);
        while let Some(idx) = cur {
            path.push(nodes[idx].poly_ref);
            cur = nodes[idx].parent;
        }
        path.reverse();
        Ok((best_pos, path))
    }

    /// Non-overlapping polygons around `center` reachable from `start_ref`
    /// through portals within `radius`, each with its parent
    pub fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: &Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<Vec<(PolyRef, Option<PolyRef>)>> {
        self.check_valid()?;
        let nav_mesh = self.nav_mesh;
        if !nav_mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::NotFound(format!("neighbourhood start {start_ref} is not loaded")));
        }

        let radius_sqr = sqr(radius);
        let mut result = vec![(start_ref, None)];
        let mut visited: HashSet<PolyRef> = HashSet::from([start_ref]);
        let mut stack = VecDeque::from([start_ref]);

        while let Some(cur_ref) = stack.pop_front() {
            let (cur_tile, cur_poly) = nav_mesh.get_tile_and_poly_by_ref(cur_ref)?;
            for link in cur_tile.links_of(cur_poly) {
                let neighbour_ref = link.reference;
                if neighbour_ref.is_null() || visited.contains(&neighbour_ref) {
                    continue;
                }
                let Ok((neighbour_tile, neighbour_poly)) =
                    nav_mesh.get_tile_and_poly_by_ref(neighbour_ref)
                else {
                    continue;
                };
                if neighbour_poly.is_off_mesh() || !filter.pass_filter(neighbour_poly) {
                    continue;
                }

                let Ok((va, vb)) = portal_points(
                    cur_tile,
                    cur_poly,
                    neighbour_ref,
                    neighbour_tile,
                    neighbour_poly,
                    cur_ref,
                ) else {
                    continue;
                };
                let (d, _) = dist_pt_seg_sqr_2d(center, &va, &vb);
                if d > radius_sqr {
                    continue;
                }
                visited.insert(neighbour_ref);

                let pa = neighbour_tile.poly_verts(neighbour_poly);
                let overlaps = result.iter().any(|&(past_ref, _)| {
                    let connected = cur_tile.links_of(cur_poly).any(|l| l.reference == past_ref);
                    if connected {
                        return false;
                    }
                    nav_mesh
                        .get_tile_and_poly_by_ref(past_ref)
                        .map(|(t, p)| overlap_poly_poly_2d(&pa, &t.poly_verts(p)))
                        .unwrap_or(false)
                });
                if overlaps {
                    continue;
                }

                if result.len() < max_result {
                    result.push((neighbour_ref, Some(cur_ref)));
                    stack.push_back(neighbour_ref);
                }
            }
        }
        Ok(result)
    }

    /// Edges of a polygon that cannot be crossed under `filter`
    pub fn poly_wall_segments(
        &self,
        poly_ref: PolyRef,
        filter: &QueryFilter,
    ) -> Result<Vec<[Vec3; 2]>> {
        self.check_valid()?;
        let nav_mesh = self.nav_mesh;
        let (tile, poly) = nav_mesh.get_tile_and_poly_by_ref(poly_ref)?;
        let verts = tile.poly_verts(poly);
        let nv = verts.len();

        let passable = |r: PolyRef| {
            nav_mesh
                .get_tile_and_poly_by_ref(r)
                .map(|(_, p)| filter.pass_filter(p))
                .unwrap_or(false)
        };

        let mut segments = Vec::new();
        for j in 0..nv {
            let vj = verts[j];
            let vi = verts[(j + 1) % nv];

            if poly.neis[j] & EXT_LINK != 0 {
                // Portal edge: walls are the stretches no link covers
                let mut covered: Vec<(u8, u8)> = tile
                    .links_of(poly)
                    .filter(|l| l.edge as usize == j && passable(l.reference))
                    .map(|l| (l.bmin.min(l.bmax), l.bmin.max(l.bmax)))
                    .collect();
                covered.sort_unstable();
                let mut from = 0u8;
                for (lo, hi) in covered {
                    if lo > from {
                        segments.push(sub_edge(&vj, &vi, from, lo));
                    }
                    from = from.max(hi);
                }
                if from < 255 {
                    segments.push(sub_edge(&vj, &vi, from, 255));
                }
                continue;
            }

            let open = poly.neis[j] != 0
                && tile
                    .links_of(poly)
                    .any(|l| l.edge as usize == j && passable(l.reference));
            if !open {
                segments.push([vj, vi]);
            }
        }
        Ok(segments)
    }
}

fn sub_edge(a: &Vec3, b: &Vec3, from: u8, to: u8) -> [Vec3; 2] {
    let s = 1.0 / 255.0;
    [
        a.lerp(*b, f32::from(from) * s),
        a.lerp(*b, f32::from(to) * s),
    ]
}

/// Portal between `from_poly` and the polygon `to_ref`
fn portal_points(
    from_tile: &MeshTile,
    from_poly: &Poly,
    to_ref: PolyRef,
    to_tile: &MeshTile,
    to_poly: &Poly,
    from_ref: PolyRef,
) -> Result<(Vec3, Vec3)> {
    let Some(link) = from_tile.links_of(from_poly).find(|l| l.reference == to_ref) else {
        return Err(Error::NotFound(format!("{from_ref} is not linked to {to_ref}")));
    };

    // Off-mesh connections meet their neighbours at a single vertex
    if from_poly.is_off_mesh() {
        let v = from_tile.verts[from_poly.verts[link.edge as usize & 1] as usize];
        return Ok((v, v));
    }
    if to_poly.is_off_mesh() {
        let Some(back) = to_tile.links_of(to_poly).find(|l| l.reference == from_ref) else {
            return Err(Error::NotFound(format!("{to_ref} is not linked to {from_ref}")));
        };
        let v = to_tile.verts[to_poly.verts[back.edge as usize & 1] as usize];
        return Ok((v, v));
    }

    let nv = from_poly.vert_count as usize;
    let edge = link.edge as usize;
    let v0 = from_tile.verts[from_poly.verts[edge] as usize];
    let v1 = from_tile.verts[from_poly.verts[(edge + 1) % nv] as usize];

    // Tile boundary links may cover only part of the edge
    if link.side != LINK_SIDE_INTERNAL && (link.bmin != 0 || link.bmax != 255) {
        let s = 1.0 / 255.0;
        return Ok((
            v0.lerp(v1, f32::from(link.bmin) * s),
            v0.lerp(v1, f32::from(link.bmax) * s),
        ));
    }
    Ok((v0, v1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::single_tile_mesh;

    #[test]
    fn test_new_validates_node_budget() -> Result<()> {
        let mesh = single_tile_mesh(2)?;
        assert!(matches!(NavMeshQuery::new(&mesh, 0), Err(Error::InvalidParam(_))));
        assert!(matches!(
            NavMeshQuery::new(&mesh, 65536),
            Err(Error::InvalidParam(_))
        ));
        assert!(NavMeshQuery::new(&mesh, 65535).is_ok());
        Ok(())
    }

    #[test]
    fn test_invalidated_query_rejects_calls() -> Result<()> {
        let mesh = single_tile_mesh(2)?;
        let mut query = NavMeshQuery::new(&mesh, 64)?;
        assert!(query.is_valid());
        query.invalidate();
        assert!(!query.is_valid());
        let r =
            query.find_nearest_poly(&Vec3::new(1.0, 0.0, 1.0), &Vec3::ONE, &QueryFilter::default());
        assert!(matches!(r, Err(Error::InvalidHandle(_))));
        assert!(matches!(
            query.get_random_position(&QueryFilter::default()),
            Err(Error::InvalidHandle(_))
        ));
        Ok(())
    }

    #[test]
    fn test_append_vertex_merges_duplicates() {
        let mut points = Vec::new();
        let p = Vec3::new(1.0, 0.0, 1.0);
        append_vertex(&mut points, 8, p, StraightPathFlags::START, PolyRef::new(1));
        append_vertex(&mut points, 8, p, StraightPathFlags::END, PolyRef::new(2));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].flags, StraightPathFlags::END);
        assert_eq!(points[0].poly, PolyRef::new(2));
    }

    #[test]
    fn test_random_is_deterministic() -> Result<()> {
        let mesh = single_tile_mesh(3)?;
        let filter = QueryFilter::default();
        let mut a = NavMeshQuery::new(&mesh, 64)?;
        let mut b = NavMeshQuery::new(&mesh, 64)?;
        a.set_random_seed(7);
        b.set_random_seed(7);
        assert_eq!(a.get_random_position(&filter)?, b.get_random_position(&filter)?);
        Ok(())
    }
}
