//! Polygon filtering and traversal cost

use glam::Vec3;

use super::nav_mesh::Poly;
use super::{PolyFlags, MAX_AREAS};

/// Decides which polygons a query may visit and what crossing them costs
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct QueryFilter {
    /// Polygons must have at least one of these flags
    pub include_flags: PolyFlags,
    /// Polygons with any of these flags are skipped
    pub exclude_flags: PolyFlags,
    /// Cost multiplier per area id
    pub area_cost: Vec<f32>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::all(),
            exclude_flags: PolyFlags::empty(),
            area_cost: vec![1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    /// Checks if the polygon may be visited
    pub fn pass_filter(&self, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }

    /// Cost of moving from `pa` to `pb` across `poly`
    pub fn cost(&self, pa: Vec3, pb: Vec3, poly: &Poly) -> f32 {
        pa.distance(pb) * self.area_cost(poly.area)
    }

    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost.get(area as usize).copied().unwrap_or(1.0)
    }

    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if let Some(slot) = self.area_cost.get_mut(area as usize) {
            *slot = cost;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_exclude() {
        let mut poly = Poly::default();
        poly.flags = PolyFlags::WALK;

        let mut filter = QueryFilter::default();
        assert!(filter.pass_filter(&poly));

        filter.exclude_flags = PolyFlags::WALK;
        assert!(!filter.pass_filter(&poly));

        let swim_only = QueryFilter {
            include_flags: PolyFlags::SWIM,
            ..Default::default()
        };
        assert!(!swim_only.pass_filter(&poly));
    }

    #[test]
    fn test_area_cost_scales_distance() {
        let mut poly = Poly::default();
        poly.area = 3;
        let mut filter = QueryFilter::default();
        filter.set_area_cost(3, 2.5);
        let cost = filter.cost(Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0), &poly);
        assert!((cost - 5.0).abs() < 1e-5);
    }
}
