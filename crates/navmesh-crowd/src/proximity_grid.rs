//! Proximity grid for neighbour queries in crowd simulation
//!
//! Items are registered in every grid cell their XZ bounds overlap, so a
//! query only has to look at the cells under its own bounds instead of
//! checking every agent.

use std::collections::HashMap;

/// Grid cell coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GridCoord {
    x: i32,
    z: i32,
}

/// Spatial hash of item ids on the XZ plane
#[derive(Debug, Clone)]
pub struct ProximityGrid {
    cells: HashMap<GridCoord, Vec<usize>>,
    cell_size: f32,
    inv_cell_size: f32,
    item_count: usize,
}

impl ProximityGrid {
    /// Creates a grid with square cells of `cell_size` world units
    pub fn new(cell_size: f32) -> Self {
        // Minimum cell size to avoid division by zero
        let cell_size = cell_size.max(0.1);
        Self {
            cells: HashMap::new(),
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            item_count: 0,
        }
    }

    /// Removes every item
    pub fn clear(&mut self) {
        self.cells.clear();
        self.item_count = 0;
    }

    fn coord(&self, x: f32, z: f32) -> GridCoord {
        GridCoord {
            x: (x * self.inv_cell_size).floor() as i32,
            z: (z * self.inv_cell_size).floor() as i32,
        }
    }

    /// Registers `id` in every cell overlapped by the given bounds
    pub fn add_item(&mut self, id: usize, min_x: f32, min_z: f32, max_x: f32, max_z: f32) {
        let lo = self.coord(min_x, min_z);
        let hi = self.coord(max_x, max_z);
        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                self.cells.entry(GridCoord { x, z }).or_default().push(id);
            }
        }
        self.item_count += 1;
    }

    /// Ids registered in the cells overlapped by the given bounds,
    /// ascending and without duplicates, at most `max_items` of them
    pub fn query_items(
        &self,
        min_x: f32,
        min_z: f32,
        max_x: f32,
        max_z: f32,
        max_items: usize,
    ) -> Vec<usize> {
        let lo = self.coord(min_x, min_z);
        let hi = self.coord(max_x, max_z);
        let mut ids = Vec::new();
        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                if let Some(cell) = self.cells.get(&GridCoord { x, z }) {
                    ids.extend_from_slice(cell);
                }
            }
        }
        ids.sort_unstable();
        ids.dedup();
        ids.truncate(max_items);
        ids
    }

    /// Number of items in the cell containing the point
    pub fn item_count_at(&self, x: f32, z: f32) -> usize {
        self.cells.get(&self.coord(x, z)).map_or(0, Vec::len)
    }

    /// Number of items added since the last clear
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_finds_overlapping_items() {
        let mut grid = ProximityGrid::new(2.0);
        grid.add_item(3, 0.5, 0.5, 1.5, 1.5);
        grid.add_item(1, 10.0, 10.0, 11.0, 11.0);
        grid.add_item(2, 1.5, 1.5, 2.5, 2.5);

        assert_eq!(grid.query_items(0.0, 0.0, 3.0, 3.0, 16), vec![2, 3]);
        assert_eq!(grid.query_items(9.0, 9.0, 12.0, 12.0, 16), vec![1]);
        assert!(grid.query_items(-20.0, -20.0, -19.0, -19.0, 16).is_empty());
        assert_eq!(grid.item_count(), 3);
    }

    #[test]
    fn test_item_spanning_cells_reported_once() {
        let mut grid = ProximityGrid::new(1.0);
        grid.add_item(7, -0.5, -0.5, 2.5, 2.5);
        assert_eq!(grid.item_count_at(2.2, 2.2), 1);
        assert_eq!(grid.item_count_at(-0.2, -0.2), 1);
        assert_eq!(grid.query_items(-1.0, -1.0, 3.0, 3.0, 16), vec![7]);
    }

    #[test]
    fn test_query_cap_and_clear() {
        let mut grid = ProximityGrid::new(4.0);
        for id in (0..10).rev() {
            grid.add_item(id, 0.0, 0.0, 1.0, 1.0);
        }
        assert_eq!(grid.query_items(0.0, 0.0, 1.0, 1.0, 4), vec![0, 1, 2, 3]);

        grid.clear();
        assert_eq!(grid.item_count(), 0);
        assert!(grid.query_items(0.0, 0.0, 1.0, 1.0, 4).is_empty());
    }

    #[test]
    fn test_minimum_cell_size() {
        let grid = ProximityGrid::new(0.0);
        assert_eq!(grid.cell_size(), 0.1);
    }
}
