//! 2D geometry operations for navigation queries
//!
//! Most operations work on the XZ plane (Y-up coordinate system). Polygons
//! are convex and wound clockwise when seen from above.

use glam::Vec3;

use crate::vector::{dist_pt_seg_sqr_2d, dot_2d, perp_2d, tri_area_2d};

const EPS: f32 = 1e-6;

/// Result of clipping a segment against a convex polygon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPolyHit {
    /// Parametric entry point along the segment
    pub tmin: f32,
    /// Parametric exit point along the segment
    pub tmax: f32,
    /// Edge crossed on entry, if the segment starts outside
    pub seg_min: Option<usize>,
    /// Edge crossed on exit, `None` if the segment ends inside
    pub seg_max: Option<usize>,
}

/// Tests whether `pt` lies inside the polygon on the XZ plane
pub fn point_in_polygon_2d(pt: &Vec3, verts: &[Vec3]) -> bool {
    let mut inside = false;
    let n = verts.len();
    if n == 0 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > pt.z) != (vj.z > pt.z))
            && (pt.x < (vj.x - vi.x) * (pt.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Squared distances from `pt` to every polygon edge (edge `j` runs from
/// vertex `j` to `j + 1`), the parametric closest position on each edge,
/// and whether the point is inside the polygon
pub fn distance_pt_poly_edges_sqr(pt: &Vec3, verts: &[Vec3]) -> (bool, Vec<(f32, f32)>) {
    let n = verts.len();
    let mut edges = Vec::with_capacity(n);
    for j in 0..n {
        let i = (j + 1) % n;
        edges.push(dist_pt_seg_sqr_2d(pt, &verts[j], &verts[i]));
    }
    (point_in_polygon_2d(pt, verts), edges)
}

/// Clips the segment `p0`-`p1` against a convex polygon.
///
/// Returns `None` when the segment misses the polygon entirely.
pub fn intersect_segment_poly_2d(p0: &Vec3, p1: &Vec3, verts: &[Vec3]) -> Option<SegmentPolyHit> {
    let mut hit = SegmentPolyHit {
        tmin: 0.0,
        tmax: 1.0,
        seg_min: None,
        seg_max: None,
    };
    let dir = *p1 - *p0;
    let n = verts.len();
    if n < 3 {
        return None;
    }

    let mut j = n - 1;
    for i in 0..n {
        let edge = verts[i] - verts[j];
        let diff = *p0 - verts[j];
        let num = perp_2d(&edge, &diff);
        let den = perp_2d(&dir, &edge);
        if den.abs() < EPS {
            // Parallel to this edge
            if num < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = num / den;
        if den < 0.0 {
            if t > hit.tmin {
                hit.tmin = t;
                hit.seg_min = Some(j);
                if hit.tmin > hit.tmax {
                    return None;
                }
            }
        } else if t < hit.tmax {
            hit.tmax = t;
            hit.seg_max = Some(j);
            if hit.tmax < hit.tmin {
                return None;
            }
        }
        j = i;
    }
    Some(hit)
}

/// Height of the triangle abc at `p`, if `p` lies within it on the XZ plane
pub fn closest_height_point_triangle(p: &Vec3, a: &Vec3, b: &Vec3, c: &Vec3) -> Option<f32> {
    let v0 = *c - *a;
    let v1 = *b - *a;
    let v2 = *p - *a;

    let mut denom = v0.x * v1.z - v0.z * v1.x;
    if denom.abs() < EPS {
        return None;
    }
    let mut u = v1.z * v2.x - v1.x * v2.z;
    let mut v = v0.x * v2.z - v0.z * v2.x;
    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    if u >= 0.0 && v >= 0.0 && (u + v) <= denom {
        Some(a.y + (v0.y * u + v1.y * v) / denom)
    } else {
        None
    }
}

/// Area of a convex polygon on the XZ plane
pub fn poly_area_2d(verts: &[Vec3]) -> f32 {
    if verts.len() < 3 {
        return 0.0;
    }
    let mut area = 0.0;
    for i in 2..verts.len() {
        area += tri_area_2d(&verts[0], &verts[i - 1], &verts[i]).abs() * 0.5;
    }
    area
}

/// Picks a point inside a convex polygon from two uniform samples `s`, `t`
/// in [0, 1). Triangles of the fan are chosen in proportion to their area.
pub fn random_point_in_convex_poly(verts: &[Vec3], s: f32, t: f32) -> Vec3 {
    let n = verts.len();
    if n < 3 {
        return verts.first().copied().unwrap_or(Vec3::ZERO);
    }

    let areas: Vec<f32> = (2..n)
        .map(|i| tri_area_2d(&verts[0], &verts[i - 1], &verts[i]).abs())
        .collect();
    let total: f32 = areas.iter().sum();

    let thr = s * total;
    let mut acc = 0.0;
    let mut tri = areas.len() - 1;
    let mut u = 1.0;
    for (i, area) in areas.iter().enumerate() {
        let next = acc + area;
        if thr <= next && *area > 0.0 {
            tri = i;
            u = ((thr - acc) / area).clamp(0.0, 1.0);
            break;
        }
        acc = next;
    }

    let a = verts[0];
    let b = verts[tri + 1];
    let c = verts[tri + 2];
    let v = t.sqrt();
    a * (1.0 - v) + b * (v * (1.0 - u)) + c * (v * u)
}

/// Separating-axis overlap test of two convex polygons on the XZ plane.
///
/// Polygons that only touch along an edge do not overlap.
pub fn overlap_poly_poly_2d(a: &[Vec3], b: &[Vec3]) -> bool {
    const OVERLAP_EPS: f32 = 1e-4;

    let project = |axis: &Vec3, poly: &[Vec3]| {
        poly.iter().fold((f32::MAX, f32::MIN), |(lo, hi), v| {
            let d = dot_2d(axis, v);
            (lo.min(d), hi.max(d))
        })
    };
    let separated_by_edges_of = |poly: &[Vec3]| {
        let n = poly.len();
        (0..n).any(|i| {
            let va = poly[(i + n - 1) % n];
            let vb = poly[i];
            let axis = Vec3::new(vb.z - va.z, 0.0, -(vb.x - va.x));
            let (amin, amax) = project(&axis, a);
            let (bmin, bmax) = project(&axis, b);
            amin + OVERLAP_EPS > bmax || amax - OVERLAP_EPS < bmin
        })
    };
    !(separated_by_edges_of(a) || separated_by_edges_of(b))
}
