use crate::geometry::bounding_box::Aabb;
use crate::geometry::PositionGlobal;

/// Upper limit for the number of cells along one axis.
const MAX_CELLS_PER_AXIS: usize = 4096;

/// A regular 2D grid over the xy plane, tracking the lowest point in each cell.
#[derive(Debug, Clone)]
pub struct CellGrid {
    min_x: f64,
    min_y: f64,
    cell_size: f64,
    size_x: usize,
    size_y: usize,
    min_z: Vec<f64>,
}

impl CellGrid {
    /// Grid over `bounds`, with cells sized so that each one receives about `cell_points` of
    /// the `nr_points` points, if those are distributed evenly.
    pub fn new(bounds: &Aabb, nr_points: u64, cell_points: usize) -> Self {
        let extent = bounds.extent();
        let longest = extent.x.max(extent.y);
        let mut cell_size = (extent.x * extent.y * cell_points as f64 / nr_points as f64).sqrt();
        if !cell_size.is_finite() || cell_size <= 0.0 {
            cell_size = if longest > 0.0 { longest } else { 1.0 };
        }
        cell_size = cell_size.max(longest / MAX_CELLS_PER_AXIS as f64);

        let size_x = (extent.x / cell_size) as usize + 1;
        let size_y = (extent.y / cell_size) as usize + 1;
        let (min_x, min_y) = if bounds.is_empty() {
            (0.0, 0.0)
        } else {
            (bounds.min.x, bounds.min.y)
        };
        CellGrid {
            min_x,
            min_y,
            cell_size,
            size_x,
            size_y,
            min_z: vec![f64::INFINITY; size_x * size_y],
        }
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn nr_cells(&self) -> usize {
        self.min_z.len()
    }

    /// Positions outside of the grid are clamped to the nearest border cell.
    fn cell(&self, position: &PositionGlobal) -> usize {
        let x = ((position.x - self.min_x) / self.cell_size).max(0.0) as usize;
        let y = ((position.y - self.min_y) / self.cell_size).max(0.0) as usize;
        y.min(self.size_y - 1) * self.size_x + x.min(self.size_x - 1)
    }

    pub fn insert(&mut self, position: &PositionGlobal) {
        let cell = self.cell(position);
        if position.z < self.min_z[cell] {
            self.min_z[cell] = position.z;
        }
    }

    /// Lowest z value inserted into the cell containing `position`.
    pub fn min_z(&self, position: &PositionGlobal) -> Option<f64> {
        let z = self.min_z[self.cell(position)];
        z.is_finite().then_some(z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::point;

    #[test]
    fn cell_size_follows_density() {
        let bounds = Aabb::new(point![0.0, 0.0, 0.0], point![100.0, 100.0, 10.0]);
        let grid = CellGrid::new(&bounds, 1_000_000, 100);
        assert!((grid.cell_size() - 1.0).abs() < 1e-9);
        assert_eq!(grid.nr_cells(), 101 * 101);
    }

    #[test]
    fn degenerate_bounds() {
        let line = Aabb::new(point![0.0, 0.0, 0.0], point![50.0, 0.0, 0.0]);
        let grid = CellGrid::new(&line, 100, 10);
        assert_eq!(grid.cell_size(), 50.0);

        let empty = CellGrid::new(&Aabb::empty(), 0, 10);
        assert_eq!(empty.nr_cells(), 1);
        assert_eq!(empty.min_z(&point![1.0, 2.0, 3.0]), None);
    }

    #[test]
    fn lowest_point_per_cell() {
        let bounds = Aabb::new(point![0.0, 0.0, 0.0], point![10.0, 10.0, 10.0]);
        let mut grid = CellGrid::new(&bounds, 100, 1);
        grid.insert(&point![0.5, 0.5, 5.0]);
        grid.insert(&point![0.7, 0.2, 3.0]);
        grid.insert(&point![0.9, 0.9, 4.0]);
        grid.insert(&point![5.5, 5.5, 7.0]);
        assert_eq!(grid.min_z(&point![0.1, 0.1, 100.0]), Some(3.0));
        assert_eq!(grid.min_z(&point![5.1, 5.9, 0.0]), Some(7.0));
        assert_eq!(grid.min_z(&point![2.5, 2.5, 0.0]), None);

        // clamped to the border
        grid.insert(&point![-3.0, 20.0, 1.0]);
        assert_eq!(grid.min_z(&point![0.0, 10.0, 0.0]), Some(1.0));
    }
}
