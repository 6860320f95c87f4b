//! Scalar math helpers

/// Square of a value
#[inline]
pub fn sqr<T: std::ops::Mul<Output = T> + Copy>(x: T) -> T {
    x * x
}

/// Linear interpolation between two values
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Get the next power of 2 greater than or equal to x
#[inline]
pub fn next_pow2(x: u32) -> u32 {
    if x == 0 {
        return 1;
    }
    let mut n = x - 1;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    n + 1
}

/// Integer log base 2
#[inline]
pub fn ilog2(x: u32) -> u32 {
    if x == 0 {
        return 0;
    }
    31 - x.leading_zeros()
}

/// Align value to 4-byte boundary
#[inline]
pub fn align4(x: usize) -> usize {
    (x + 3) & !3
}

/// Number of tile-index bits needed to address every tile of a square map.
///
/// The tile count is rounded up to a power of two before taking the log,
/// so the result addresses `1 << bits` tiles.
pub fn tile_bits_for_map(tile_size: i32, cell_size: f32, map_size: f32) -> u32 {
    let tile_world_size = tile_size as f32 * cell_size;
    if tile_world_size <= 0.0 {
        return 0;
    }
    let tiles_per_side = map_size / tile_world_size;
    let max_tiles = (tiles_per_side * tiles_per_side).ceil().max(1.0) as u32;
    ilog2(next_pow2(max_tiles))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_pow2() {
        assert_eq!(next_pow2(0), 1);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(5), 8);
        assert_eq!(next_pow2(64), 64);
        assert_eq!(next_pow2(65), 128);
    }

    #[test]
    fn test_ilog2() {
        assert_eq!(ilog2(1), 0);
        assert_eq!(ilog2(8), 3);
        assert_eq!(ilog2(1024), 10);
    }

    #[test]
    fn test_align4() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(13), 16);
    }

    #[test]
    fn test_tile_bits_for_map() {
        // 64 cells of 0.5 = 32 units per tile, 1024 map = 32x32 tiles = 1024 tiles
        assert_eq!(tile_bits_for_map(64, 0.5, 1024.0), 10);
        // 1000 tiles round up to 1024
        assert_eq!(tile_bits_for_map(10, 1.0, 316.3), 10);
        assert_eq!(tile_bits_for_map(64, 1.0, 10.0), 0);
    }
}
