//! Fixed obstacle avoidance quality presets

use crate::ObstacleAvoidanceParams;

/// Number of avoidance presets a crowd carries
pub const MAX_AVOIDANCE_PROFILES: usize = 4;

/// Immutable table of avoidance presets, ordered from cheapest to most accurate
///
/// | idx | name   | divs | rings | depth | samples |
/// |-----|--------|------|-------|-------|---------|
/// | 0   | Low    | 5    | 2     | 1     | 11      |
/// | 1   | Medium | 5    | 2     | 2     | 22      |
/// | 2   | Good   | 7    | 2     | 3     | 45      |
/// | 3   | High   | 7    | 3     | 3     | 66      |
#[derive(Debug, Clone, PartialEq)]
pub struct AvoidanceProfiles {
    params: [ObstacleAvoidanceParams; MAX_AVOIDANCE_PROFILES],
}

impl AvoidanceProfiles {
    pub const LOW: usize = 0;
    pub const MEDIUM: usize = 1;
    pub const GOOD: usize = 2;
    pub const HIGH: usize = 3;

    pub fn new() -> Self {
        let preset = |divs, rings, depth| ObstacleAvoidanceParams {
            vel_bias: 0.5,
            adaptive_divs: divs,
            adaptive_rings: rings,
            adaptive_depth: depth,
            ..Default::default()
        };
        Self {
            params: [preset(5, 2, 1), preset(5, 2, 2), preset(7, 2, 3), preset(7, 3, 3)],
        }
    }

    pub fn get(&self, idx: usize) -> Option<&ObstacleAvoidanceParams> {
        self.params.get(idx)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObstacleAvoidanceParams> {
        self.params.iter()
    }
}

impl Default for AvoidanceProfiles {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_sample_counts() {
        let profiles = AvoidanceProfiles::new();
        let counts: Vec<usize> = profiles.iter().map(|p| p.sample_count()).collect();
        assert_eq!(counts, vec![11, 22, 45, 66]);
        assert_eq!(profiles.len(), MAX_AVOIDANCE_PROFILES);
    }

    #[test]
    fn test_shared_weights() {
        let profiles = AvoidanceProfiles::default();
        for p in profiles.iter() {
            assert_eq!(p.vel_bias, 0.5);
            assert_eq!(p.weight_des_vel, 2.0);
            assert_eq!(p.weight_cur_vel, 0.75);
            assert_eq!(p.weight_side, 0.75);
            assert_eq!(p.weight_toi, 2.5);
            assert_eq!(p.horiz_time, 2.5);
        }
        assert!(profiles.get(AvoidanceProfiles::HIGH).is_some());
        assert!(profiles.get(4).is_none());
    }
}
