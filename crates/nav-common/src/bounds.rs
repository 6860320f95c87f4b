//! Axis-aligned bounding boxes

use glam::Vec3;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BoundingBox {
    /// Minimum bounds
    pub min: Vec3,
    /// Maximum bounds
    pub max: Vec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    /// Creates a box from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Creates an empty box that any merge will overwrite
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    /// Creates a box of the given full size around `center`
    pub fn from_center(center: Vec3, size: Vec3) -> Self {
        let extents = size * 0.5;
        Self::new(center - extents, center + extents)
    }

    /// Creates a box spanning `center ± half_extents`
    pub fn from_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self::new(center - half_extents, center + half_extents)
    }

    /// Creates the smallest box containing every point
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vec3>) -> Self {
        points
            .into_iter()
            .fold(Self::empty(), |acc, p| acc.merge(*p))
    }

    /// Checks if this box has non-negative extent on every axis
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    /// Returns a box grown to include `point`
    pub fn merge(&self, point: Vec3) -> Self {
        Self::new(self.min.min(point), self.max.max(point))
    }

    /// Returns a box grown to include `rhs`
    pub fn merge_box(&self, rhs: &BoundingBox) -> Self {
        Self::new(self.min.min(rhs.min), self.max.max(rhs.max))
    }

    /// Checks if the two boxes overlap (touching counts)
    pub fn intersects(&self, rhs: &BoundingBox) -> bool {
        self.min.cmple(rhs.max).all() && rhs.min.cmple(self.max).all()
    }

    /// Checks if the point lies inside or on the box
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.min.cmple(point).all() && point.cmple(self.max).all()
    }

    /// Grows the box by `amount` on every side
    pub fn expand(&mut self, amount: f32) {
        self.min -= Vec3::splat(amount);
        self.max += Vec3::splat(amount);
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_center() {
        let b = BoundingBox::from_center(Vec3::new(1.0, 1.0, 1.0), Vec3::splat(2.0));
        assert_eq!(b.min, Vec3::ZERO);
        assert_eq!(b.max, Vec3::splat(2.0));
        assert_eq!(b.center(), Vec3::ONE);
    }

    #[test]
    fn test_merge_and_contains() {
        let pts = [Vec3::new(-1.0, 0.0, 2.0), Vec3::new(3.0, 1.0, -2.0)];
        let b = BoundingBox::from_points(pts.iter());
        assert!(b.is_valid());
        assert!(b.contains_point(Vec3::new(0.0, 0.5, 0.0)));
        assert!(!b.contains_point(Vec3::new(0.0, 1.5, 0.0)));
        assert!(!BoundingBox::empty().is_valid());
    }

    #[test]
    fn test_intersects() {
        let a = BoundingBox::new(Vec3::ZERO, Vec3::ONE);
        let b = BoundingBox::new(Vec3::splat(1.0), Vec3::splat(2.0));
        let c = BoundingBox::new(Vec3::splat(1.5), Vec3::splat(2.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));

        let mut d = c;
        d.expand(0.5);
        assert!(a.intersects(&d));
    }
}
