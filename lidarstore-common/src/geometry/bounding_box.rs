use super::PositionGlobal;
use nalgebra::{point, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};

/// An axis aligned bounding box in world coordinates.
/// An Aabb can also be empty. An empty aabb is represented by
/// setting the minimum to f64::MAX and the maximum to f64::MIN.
#[derive(Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: PositionGlobal,
    pub max: PositionGlobal,
}

impl Aabb {
    /// Constructs an empty bounding box.
    pub fn empty() -> Self {
        Aabb {
            min: point![f64::MAX, f64::MAX, f64::MAX],
            max: point![f64::MIN, f64::MIN, f64::MIN],
        }
    }

    /// Construct a new AABB with the given bounds.
    pub fn new(min: PositionGlobal, max: PositionGlobal) -> Self {
        Aabb { min, max }
    }

    /// Checks, if the bounding box is empty.
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Size along each axis. Zero for empty boxes.
    pub fn extent(&self) -> Vector3<f64> {
        if self.is_empty() {
            Vector3::zeros()
        } else {
            self.max - self.min
        }
    }

    pub fn volume(&self) -> f64 {
        let e = self.extent();
        e.x * e.y * e.z
    }

    /// Check, if the given point is within the bounds (inclusive on all sides).
    pub fn contains(&self, point: &PositionGlobal) -> bool {
        self.min.x <= point.x
            && self.min.y <= point.y
            && self.min.z <= point.z
            && self.max.x >= point.x
            && self.max.y >= point.y
            && self.max.z >= point.z
    }

    /// Grow the bounding box, so that it contains the given position.
    pub fn extend(&mut self, position: &PositionGlobal) {
        for i in 0..3 {
            if self.min[i] > position[i] {
                self.min[i] = position[i];
            }
            if self.max[i] < position[i] {
                self.max[i] = position[i];
            }
        }
    }

    /// Returns a copy of this box, grown by `margin` on every side.
    pub fn padded(&self, margin: Vector3<f64>) -> Self {
        Aabb {
            min: self.min - margin,
            max: self.max + margin,
        }
    }

    /// returns the center of the bounding box, or None if the bounding box is empty.
    pub fn center(&self) -> Option<PositionGlobal> {
        if self.is_empty() {
            None
        } else {
            Some(nalgebra::center(&self.min, &self.max))
        }
    }

    /// Checks if the two bounding boxes overlap.
    /// Boxes that only touch at a face count as overlapping.
    pub fn intersects_aabb(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        for i in 0..3 {
            if self.max[i] < other.min[i] || self.min[i] > other.max[i] {
                return false;
            }
        }
        true
    }

    /// Checks if the `other` bounding box is fully inside this bounding box.
    pub fn contains_aabb(&self, other: &Self) -> bool {
        for i in 0..3 {
            if other.min[i] < self.min[i] || other.max[i] > self.max[i] {
                return false;
            }
        }
        true
    }

    /// Index of the octant that the given position falls into.
    ///
    /// Bit 0 selects the upper half in x, bit 1 in y, bit 2 in z.
    /// Coordinates exactly on a splitting plane belong to the lower half.
    pub fn octant_of(&self, position: &PositionGlobal) -> usize {
        let center = nalgebra::center(&self.min, &self.max);
        let mut octant = 0;
        if position.x > center.x {
            octant |= 1;
        }
        if position.y > center.y {
            octant |= 2;
        }
        if position.z > center.z {
            octant |= 4;
        }
        octant
    }

    /// The bounding box of the octant with the given index (see [Aabb::octant_of]).
    pub fn octant_box(&self, octant: usize) -> Aabb {
        let center = nalgebra::center(&self.min, &self.max);
        let mut min = self.min;
        let mut max = center;
        for axis in 0..3 {
            if octant & (1 << axis) != 0 {
                min[axis] = center[axis];
                max[axis] = self.max[axis];
            }
        }
        Aabb { min, max }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl Debug for Aabb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "Aabb (empty)")
        } else {
            write!(
                f,
                "Aabb ({:?},{:?},{:?} - {:?},{:?},{:?})",
                self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Aabb;
    use nalgebra::point;

    #[test]
    fn is_empty() {
        let aabb = Aabb::empty();
        assert!(aabb.is_empty());
        assert_eq!(aabb.volume(), 0.0);

        let aabb = Aabb::new(point![2.0, 4.0, 1.0], point![4.0, 5.0, 2.0]);
        assert!(!aabb.is_empty());
        assert_eq!(aabb.volume(), 2.0);
    }

    #[test]
    fn contains() {
        let aabb = Aabb::new(point![2.0, 4.0, 1.0], point![4.0, 5.0, 2.0]);
        assert!(aabb.contains(&point![2.0, 4.0, 1.0]));
        assert!(aabb.contains(&point![3.0, 4.5, 1.5]));
        assert!(aabb.contains(&point![4.0, 5.0, 2.0]));
        assert!(!aabb.contains(&point![1.5, 4.5, 1.5]));
        assert!(!aabb.contains(&point![4.5, 4.5, 1.5]));
        assert!(!aabb.contains(&point![3.0, 3.5, 1.5]));
        assert!(!aabb.contains(&point![3.0, 4.5, 2.5]));
    }

    #[test]
    fn extend() {
        let mut aabb = Aabb::empty();
        aabb.extend(&point![1.0, 2.0, 3.0]);
        aabb.extend(&point![-1.0, 5.0, 0.0]);
        assert_eq!(aabb, Aabb::new(point![-1.0, 2.0, 0.0], point![1.0, 5.0, 3.0]));
    }

    #[test]
    fn intersects() {
        let a = Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 1.0, 1.0]);
        let touching = Aabb::new(point![1.0, 0.0, 0.0], point![2.0, 1.0, 1.0]);
        let apart = Aabb::new(point![1.5, 0.0, 0.0], point![2.0, 1.0, 1.0]);
        assert!(a.intersects_aabb(&touching));
        assert!(!a.intersects_aabb(&apart));
        assert!(!a.intersects_aabb(&Aabb::empty()));
    }

    #[test]
    fn octants_partition_the_box() {
        let aabb = Aabb::new(point![0.0, 0.0, 0.0], point![2.0, 4.0, 8.0]);
        for octant in 0..8 {
            let b = aabb.octant_box(octant);
            assert!(aabb.contains_aabb(&b));
            assert_eq!(b.volume(), aabb.volume() / 8.0);
            let inner = b.center().unwrap();
            assert_eq!(aabb.octant_of(&inner), octant);
        }
    }

    #[test]
    fn octant_ties_go_low() {
        let aabb = Aabb::new(point![0.0, 0.0, 0.0], point![2.0, 2.0, 2.0]);
        assert_eq!(aabb.octant_of(&point![1.0, 1.0, 1.0]), 0);
        assert_eq!(aabb.octant_of(&point![1.0, 1.5, 1.0]), 2);
        assert_eq!(aabb.octant_of(&point![2.0, 2.0, 2.0]), 7);
    }
}
