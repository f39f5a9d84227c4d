pub mod bounding_box;
pub mod coordinate_system;

use nalgebra::Point3;

/// Position in world coordinates.
pub type PositionGlobal = Point3<f64>;

/// Position in the scaled integer coordinates of a dataset's files.
pub type PositionLocal = Point3<i32>;
