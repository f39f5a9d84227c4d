use super::{bounding_box::Aabb, PositionGlobal, PositionLocal};
use nalgebra::{vector, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for [CoordinateSystem::encode_position].
#[derive(Debug, Error, Clone)]
pub enum CoordinateSystemError {
    #[error(
        "The coordinate cannot be represented in this coordinate system, because it is out of its bounds."
    )]
    OutOfBounds,

    #[error("Invalid scale {0:?}: all components must be positive and finite.")]
    InvalidScale(Vector3<f64>),
}

/// The coordinate system is used to convert between
/// the stored integer coordinates and actual "world coordinates".
#[derive(Debug, Clone, PartialEq, Copy, Serialize, Deserialize)]
pub struct CoordinateSystem {
    scale: Vector3<f64>,
    offset: Vector3<f64>,
}

impl CoordinateSystem {
    /// Construct a new coordinate system with unit scale and no offset
    pub fn new_identity() -> Self {
        CoordinateSystem {
            scale: vector![1.0, 1.0, 1.0],
            offset: vector![0.0, 0.0, 0.0],
        }
    }

    /// Construct a new coordinate system with the given scale and offset
    pub fn new(scale: Vector3<f64>, offset: Vector3<f64>) -> Result<Self, CoordinateSystemError> {
        if scale.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(CoordinateSystemError::InvalidScale(scale));
        }
        Ok(CoordinateSystem { scale, offset })
    }

    /// Coordinate system that places the origin at the minimum corner of the given bounds.
    /// Fails, if the bounds are too large to be represented with the given scale.
    pub fn for_bounds(bounds: &Aabb, scale: Vector3<f64>) -> Result<Self, CoordinateSystemError> {
        let cs = Self::new(scale, bounds.min.coords)?;
        cs.encode_position(&bounds.max)?;
        Ok(cs)
    }

    pub fn scale(&self) -> &Vector3<f64> {
        &self.scale
    }

    pub fn offset(&self) -> &Vector3<f64> {
        &self.offset
    }

    pub fn encode_position(
        &self,
        global: &PositionGlobal,
    ) -> Result<PositionLocal, CoordinateSystemError> {
        // transformation
        let inner = (global.coords - self.offset).component_div(&self.scale);

        // bounds check
        let int_min = i32::MIN as f64;
        let int_max = i32::MAX as f64;
        if inner.iter().any(|c| !(int_min..=int_max).contains(&c.round())) {
            return Err(CoordinateSystemError::OutOfBounds);
        }

        // convert to int
        Ok(inner.map(|c| c.round() as i32).into())
    }

    pub fn decode_position(&self, pos: &PositionLocal) -> PositionGlobal {
        let pos_f64 = pos.map(|c| c as f64).coords;
        (self.offset + pos_f64.component_mul(&self.scale)).into()
    }

    /// Snaps a world position to the nearest position representable in this coordinate system.
    pub fn quantize(&self, global: &PositionGlobal) -> Result<PositionGlobal, CoordinateSystemError> {
        let local = self.encode_position(global)?;
        Ok(self.decode_position(&local))
    }
}

impl Default for CoordinateSystem {
    fn default() -> Self {
        Self::new_identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::point;

    #[test]
    fn encode_decode() {
        let cs = CoordinateSystem::new(vector![0.01, 0.01, 0.1], vector![100.0, 200.0, 0.0]).unwrap();
        let local = cs.encode_position(&point![101.234, 199.5, 5.07]).unwrap();
        assert_eq!(local, point![123, -50, 51]);
        let global = cs.decode_position(&local);
        assert!((global - point![101.23, 199.5, 5.1]).norm() < 1e-9);
    }

    #[test]
    fn out_of_bounds() {
        let cs = CoordinateSystem::new(vector![0.001, 0.001, 0.001], vector![0.0, 0.0, 0.0]).unwrap();
        assert!(cs.encode_position(&point![1.0e7, 0.0, 0.0]).is_err());
        assert!(cs.encode_position(&point![1.0e6, 0.0, 0.0]).is_ok());
    }

    #[test]
    fn rejects_bad_scale() {
        assert!(CoordinateSystem::new(vector![0.0, 1.0, 1.0], Vector3::zeros()).is_err());
        assert!(CoordinateSystem::new(vector![1.0, f64::NAN, 1.0], Vector3::zeros()).is_err());
    }
}
