//! Velocity-sampling obstacle avoidance
//!
//! Candidate velocities are scored against nearby agents (circles) and walls
//! (segments). The adaptive sampler evaluates a ring pattern around the
//! biased desired velocity and refines it around the best candidate.

use glam::Vec3;

use nav_common::{dist_2d, dist_pt_seg_sqr_2d, dot_2d, normalize_2d, perp_2d, sqr, tri_area_2d};

pub const MAX_PATTERN_DIVS: usize = 32;
pub const MAX_PATTERN_RINGS: usize = 4;

const EPS: f32 = 0.0001;

/// Moving circular obstacle
#[derive(Debug, Clone, Default)]
pub struct ObstacleCircle {
    /// Position of the obstacle
    pub p: Vec3,
    /// Velocity of the obstacle
    pub vel: Vec3,
    /// Desired velocity of the obstacle
    pub dvel: Vec3,
    /// Radius of the obstacle
    pub rad: f32,
    /// Use for side selection during sampling
    pub dp: Vec3,
    /// Use for side selection during sampling
    pub np: Vec3,
}

/// Static wall segment
#[derive(Debug, Clone, Default)]
pub struct ObstacleSegment {
    pub p: Vec3,
    pub q: Vec3,
    /// The agent is practically touching the segment
    pub touch: bool,
}

/// Sampling weights and pattern of one avoidance quality level
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ObstacleAvoidanceParams {
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    pub weight_toi: f32,
    pub horiz_time: f32,
    pub adaptive_divs: u8,
    pub adaptive_rings: u8,
    pub adaptive_depth: u8,
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
        }
    }
}

impl ObstacleAvoidanceParams {
    /// Candidate velocities evaluated per call when none are discarded
    pub fn sample_count(&self) -> usize {
        let divs = (self.adaptive_divs as usize).clamp(1, MAX_PATTERN_DIVS);
        let rings = (self.adaptive_rings as usize).clamp(1, MAX_PATTERN_RINGS);
        self.adaptive_depth as usize * (1 + divs * rings)
    }
}

/// Result of one adaptive sampling run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvoidanceSample {
    /// Chosen velocity
    pub velocity: Vec3,
    /// Candidates evaluated
    pub samples: usize,
}

/// Obstacle set and scratch state for velocity sampling
#[derive(Debug, Default)]
pub struct ObstacleAvoidanceQuery {
    params: ObstacleAvoidanceParams,
    inv_horiz_time: f32,
    inv_vmax: f32,

    max_circles: usize,
    circles: Vec<ObstacleCircle>,

    max_segments: usize,
    segments: Vec<ObstacleSegment>,
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            max_circles,
            circles: Vec::with_capacity(max_circles),
            max_segments,
            segments: Vec::with_capacity(max_segments),
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    /// Adds a moving obstacle; ignored once the circle budget is used
    pub fn add_circle(&mut self, pos: Vec3, rad: f32, vel: Vec3, dvel: Vec3) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(ObstacleCircle {
            p: pos,
            vel,
            dvel,
            rad,
            ..Default::default()
        });
    }

    pub fn add_segment(&mut self, p: Vec3, q: Vec3) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(ObstacleSegment { p, q, touch: false });
    }

    pub fn circles(&self) -> &[ObstacleCircle] {
        &self.circles
    }

    pub fn segments(&self) -> &[ObstacleSegment] {
        &self.segments
    }

    /// Picks the best velocity for an agent at `pos` moving with `vel`
    /// that wants to move with `dvel`.
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
    ) -> AvoidanceSample {
        self.prepare(pos, dvel);
        self.params = *params;
        self.inv_horiz_time = 1.0 / params.horiz_time;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };

        let pattern = sample_pattern(params, dvel);

        let mut cr = vmax * (1.0 - params.vel_bias);
        let mut res = Vec3::new(dvel.x * params.vel_bias, 0.0, dvel.z * params.vel_bias);
        let mut ns = 0;

        for _ in 0..params.adaptive_depth {
            let mut min_penalty = f32::MAX;
            let mut bvel = Vec3::ZERO;

            for &(px, pz) in &pattern {
                let vcand = Vec3::new(res.x + px * cr, 0.0, res.z + pz * cr);
                if sqr(vcand.x) + sqr(vcand.z) > sqr(vmax + 0.001) {
                    continue;
                }
                let penalty = self.process_sample(vcand, pos, rad, vel, dvel, min_penalty);
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    bvel = vcand;
                }
            }

            res = bvel;
            cr *= 0.5;
        }

        AvoidanceSample {
            velocity: res,
            samples: ns,
        }
    }

    fn prepare(&mut self, pos: Vec3, dvel: Vec3) {
        for cir in &mut self.circles {
            let dp = normalize_2d(&(cir.p - pos));
            let dv = cir.dvel - dvel;
            let a = tri_area_2d(&Vec3::ZERO, &dp, &dv);
            cir.np = if a < 0.01 {
                Vec3::new(-dp.z, 0.0, dp.x)
            } else {
                Vec3::new(dp.z, 0.0, -dp.x)
            };
            cir.dp = dp;
        }

        for seg in &mut self.segments {
            let (d, _) = dist_pt_seg_sqr_2d(&pos, &seg.p, &seg.q);
            seg.touch = d < sqr(0.01);
        }
    }

    fn process_sample(
        &self,
        vcand: Vec3,
        pos: Vec3,
        rad: f32,
        vel: Vec3,
        dvel: Vec3,
        min_penalty: f32,
    ) -> f32 {
        let params = &self.params;

        // Penalty for straying away from the desired and current velocities
        let vpen = params.weight_des_vel * (dist_2d(&vcand, &dvel) * self.inv_vmax);
        let vcpen = params.weight_cur_vel * (dist_2d(&vcand, &vel) * self.inv_vmax);

        // Bail out early once the best penalty cannot be beaten
        let min_pen = min_penalty - vpen - vcpen;
        let t_threshold = (params.weight_toi / min_pen - 0.1) * params.horiz_time;
        if t_threshold - params.horiz_time > -f32::EPSILON {
            return min_penalty;
        }

        let mut tmin = params.horiz_time;
        let mut side = 0.0;
        let mut nside = 0;

        for cir in &self.circles {
            // Reciprocal velocity obstacle
            let vab = vcand * 2.0 - vel - cir.vel;

            side += (dot_2d(&cir.dp, &vab) * 0.5 + 0.5)
                .min(dot_2d(&cir.np, &vab) * 2.0)
                .clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(pos, rad, vab, cir.p, cir.rad) else {
                continue;
            };

            // Overlapping obstacles are avoided more
            if htmin < 0.0 && htmax > 0.0 {
                htmin = -htmin * 0.5;
            }

            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        for seg in &self.segments {
            let mut htmin = if seg.touch {
                // Moving away from a touched wall is free
                let sdir = seg.q - seg.p;
                let snorm = Vec3::new(-sdir.z, 0.0, sdir.x);
                if dot_2d(&snorm, &vcand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match isect_ray_seg(pos, vcand, seg.p, seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };

            // Walls are avoided less than agents
            htmin *= 2.0;

            if htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        if nside > 0 {
            side /= nside as f32;
        }

        let spen = params.weight_side * side;
        let tpen = params.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));

        vpen + vcpen + spen + tpen
    }
}

/// Unit-radius ring offsets: the center, then `rings` rings of `divs`
/// points, alternating left and right of the desired direction
fn sample_pattern(params: &ObstacleAvoidanceParams, dvel: Vec3) -> Vec<(f32, f32)> {
    let ndivs = (params.adaptive_divs as usize).clamp(1, MAX_PATTERN_DIVS);
    let nrings = (params.adaptive_rings as usize).clamp(1, MAX_PATTERN_RINGS);
    let da = (1.0 / ndivs as f32) * std::f32::consts::PI * 2.0;
    let (sa, ca) = da.sin_cos();

    let dir = normalize_2d(&dvel);
    let rotated = rotate_2d(dir, da * 0.5);
    let ddir = [dir, rotated];

    let mut pattern = Vec::with_capacity(1 + ndivs * nrings);
    pattern.push((0.0, 0.0));

    for j in 0..nrings {
        let r = (nrings - j) as f32 / nrings as f32;
        let base = ddir[j % 2];
        let first = (base.x * r, base.z * r);
        pattern.push(first);
        let mut last1 = first;
        let mut last2 = first;

        let mut i = 1;
        while i + 1 < ndivs {
            // Next point on the right, then on the left
            let right = (last1.0 * ca + last1.1 * sa, -last1.0 * sa + last1.1 * ca);
            let left = (last2.0 * ca - last2.1 * sa, last2.0 * sa + last2.1 * ca);
            pattern.push(right);
            pattern.push(left);
            last1 = right;
            last2 = left;
            i += 2;
        }

        if ndivs & 1 == 0 {
            pattern.push((last2.0 * ca - last2.1 * sa, last2.0 * sa + last2.1 * ca));
        }
    }
    pattern
}

fn rotate_2d(v: Vec3, ang: f32) -> Vec3 {
    let (s, c) = ang.sin_cos();
    Vec3::new(v.x * c - v.z * s, 0.0, v.x * s + v.z * c)
}

/// Times at which a circle at `c0` moving with `v` touches a circle at `c1`
fn sweep_circle_circle(c0: Vec3, r0: f32, v: Vec3, c1: Vec3, r1: f32) -> Option<(f32, f32)> {
    let s = c1 - c0;
    let r = r0 + r1;
    let c = dot_2d(&s, &s) - r * r;
    let a = dot_2d(&v, &v);
    if a < EPS {
        // Not moving
        return None;
    }
    let b = dot_2d(&v, &s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }
    let a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * a, (b + rd) * a))
}

/// Parameter along the ray `ap + t * u` where it crosses segment `bp`-`bq`
fn isect_ray_seg(ap: Vec3, u: Vec3, bp: Vec3, bq: Vec3) -> Option<f32> {
    let v = bq - bp;
    let w = ap - bp;
    let d = perp_2d(&u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    let d = 1.0 / d;
    let t = perp_2d(&v, &w) * d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = perp_2d(&u, &w) * d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(divs: u8, rings: u8, depth: u8) -> ObstacleAvoidanceParams {
        ObstacleAvoidanceParams {
            vel_bias: 0.5,
            adaptive_divs: divs,
            adaptive_rings: rings,
            adaptive_depth: depth,
            ..Default::default()
        }
    }

    #[test]
    fn test_pattern_size() {
        for (divs, rings) in [(5, 2), (7, 2), (7, 3), (6, 1), (8, 4)] {
            let p = params(divs, rings, 1);
            let pattern = sample_pattern(&p, Vec3::X);
            assert_eq!(pattern.len(), 1 + divs as usize * rings as usize);
            assert!(pattern.iter().all(|&(x, z)| (x * x + z * z).sqrt() <= 1.0 + 1e-5));
        }
    }

    #[test]
    fn test_unobstructed_keeps_desired_velocity() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let dvel = Vec3::new(2.0, 0.0, 0.0);
        let p = params(7, 2, 3);
        let result = query.sample_velocity_adaptive(Vec3::ZERO, 0.5, 4.0, dvel, dvel, &p);
        assert_eq!(result.samples, p.sample_count());
        assert!(result.velocity.distance(dvel) < 0.3);
    }

    #[test]
    fn test_head_on_obstacle_deflects() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let dvel = Vec3::new(2.0, 0.0, 0.0);
        query.add_circle(Vec3::new(1.5, 0.0, 0.0), 0.5, -dvel, -dvel);
        let result =
            query.sample_velocity_adaptive(Vec3::ZERO, 0.5, 2.0, dvel, dvel, &params(7, 3, 3));
        assert!(result.velocity.z.abs() > 0.05 || result.velocity.x < 1.5);
    }

    #[test]
    fn test_budgets() {
        let mut query = ObstacleAvoidanceQuery::new(1, 1);
        query.add_circle(Vec3::X, 0.5, Vec3::ZERO, Vec3::ZERO);
        query.add_circle(Vec3::Z, 0.5, Vec3::ZERO, Vec3::ZERO);
        query.add_segment(Vec3::ZERO, Vec3::X);
        query.add_segment(Vec3::ZERO, Vec3::Z);
        assert_eq!(query.circles().len(), 1);
        assert_eq!(query.segments().len(), 1);
        query.reset();
        assert!(query.circles().is_empty());
    }

    #[test]
    fn test_isect_ray_seg() {
        let t = isect_ray_seg(
            Vec3::ZERO,
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, 1.0),
        );
        assert!((t.expect("crosses") - 0.5).abs() < 1e-5);
        assert!(isect_ray_seg(
            Vec3::ZERO,
            Vec3::Z,
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, 1.0)
        )
        .is_none());
    }
}
