//! Vector utilities working on the XZ plane (Y-up coordinate system)

use glam::Vec3;

/// Squared tolerance used when comparing two positions for equality
const VEQUAL_THRESHOLD_SQR: f32 = (1.0 / 16384.0) * (1.0 / 16384.0);

/// Calculates the distance between two points on the XZ plane
#[inline]
pub fn dist_2d(a: &Vec3, b: &Vec3) -> f32 {
    dist_sqr_2d(a, b).sqrt()
}

/// Calculates the squared distance between two points on the XZ plane
#[inline]
pub fn dist_sqr_2d(a: &Vec3, b: &Vec3) -> f32 {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    dx * dx + dz * dz
}

/// Length of a vector projected onto the XZ plane
#[inline]
pub fn len_2d(v: &Vec3) -> f32 {
    (v.x * v.x + v.z * v.z).sqrt()
}

/// Dot product on the XZ plane
#[inline]
pub fn dot_2d(a: &Vec3, b: &Vec3) -> f32 {
    a.x * b.x + a.z * b.z
}

/// Perp-dot product on the XZ plane
#[inline]
pub fn perp_2d(u: &Vec3, v: &Vec3) -> f32 {
    u.z * v.x - u.x * v.z
}

/// Twice the signed area of triangle abc on the XZ plane.
///
/// Positive when the points wind clockwise seen from above.
#[inline]
pub fn tri_area_2d(a: &Vec3, b: &Vec3, c: &Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let acx = c.x - a.x;
    let acz = c.z - a.z;
    acx * abz - abx * acz
}

/// Returns true when the two points are (nearly) the same
#[inline]
pub fn vequal(a: &Vec3, b: &Vec3) -> bool {
    a.distance_squared(*b) < VEQUAL_THRESHOLD_SQR
}

/// Flattens the vector onto the XZ plane and normalizes it; zero stays zero
#[inline]
pub fn normalize_2d(v: &Vec3) -> Vec3 {
    let len = len_2d(v);
    if len > 0.0001 {
        Vec3::new(v.x / len, 0.0, v.z / len)
    } else {
        Vec3::ZERO
    }
}

/// Squared distance from `pt` to segment `p`-`q` on the XZ plane, and the
/// parametric position of the closest point along the segment
pub fn dist_pt_seg_sqr_2d(pt: &Vec3, p: &Vec3, q: &Vec3) -> (f32, f32) {
    let pqx = q.x - p.x;
    let pqz = q.z - p.z;
    let dx = pt.x - p.x;
    let dz = pt.z - p.z;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = p.x + t * pqx - pt.x;
    let dz = p.z + t * pqz - pt.z;
    (dx * dx + dz * dz, t)
}

/// Clamps the length of `v` to at most `max_len`
#[inline]
pub fn clamp_length(v: Vec3, max_len: f32) -> Vec3 {
    let len_sq = v.length_squared();
    if len_sq > max_len * max_len && len_sq > 0.0 {
        v * (max_len / len_sq.sqrt())
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dist_2d_ignores_height() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 100.0, 4.0);
        assert!((dist_2d(&a, &b) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_tri_area_2d_winding() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(0.0, 0.0, 1.0);
        let c = Vec3::new(1.0, 0.0, 0.0);
        assert!(tri_area_2d(&a, &b, &c) > 0.0);
        assert!(tri_area_2d(&a, &c, &b) < 0.0);
    }

    #[test]
    fn test_dist_pt_seg() {
        let p = Vec3::new(0.0, 0.0, 0.0);
        let q = Vec3::new(2.0, 0.0, 0.0);
        let (d, t) = dist_pt_seg_sqr_2d(&Vec3::new(1.0, 0.0, 1.0), &p, &q);
        assert!((d - 1.0).abs() < 1e-5);
        assert!((t - 0.5).abs() < 1e-5);

        let (d, t) = dist_pt_seg_sqr_2d(&Vec3::new(-1.0, 0.0, 0.0), &p, &q);
        assert!((d - 1.0).abs() < 1e-5);
        assert_eq!(t, 0.0);
    }

    #[test]
    fn test_clamp_length() {
        let v = clamp_length(Vec3::new(3.0, 0.0, 4.0), 1.0);
        assert!((v.length() - 1.0).abs() < 1e-5);
        let v = clamp_length(Vec3::new(0.3, 0.0, 0.4), 1.0);
        assert!((v.length() - 0.5).abs() < 1e-5);
    }
}
