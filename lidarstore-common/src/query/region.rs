use super::NodeQueryResult;
use crate::geometry::bounding_box::Aabb;
use crate::geometry::PositionGlobal;
use nalgebra::vector;
use serde::{Deserialize, Serialize};

/// The spatial part of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Region {
    /// No spatial restriction.
    #[default]
    None,
    Box(Aabb),
    Cylinder(Cylinder),
}

/// A cylinder given by the two end points of its axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cylinder {
    pub start: PositionGlobal,
    pub end: PositionGlobal,
    pub radius: f64,
}

impl Cylinder {
    pub fn new(start: PositionGlobal, end: PositionGlobal, radius: f64) -> Self {
        Cylinder { start, end, radius }
    }

    /// A point is inside, if its projection onto the axis falls between the end points
    /// and its distance to the axis is at most the radius.
    /// Cylinders with coinciding end points or a negative radius contain nothing.
    pub fn contains(&self, point: &PositionGlobal) -> bool {
        let axis = self.end - self.start;
        let len_sq = axis.norm_squared();
        if !(len_sq > 0.0) || !(self.radius >= 0.0) {
            return false;
        }
        let rel = *point - self.start;
        let t = rel.dot(&axis) / len_sq;
        if !(0.0..=1.0).contains(&t) {
            return false;
        }
        let dist_sq = (rel - axis * t).norm_squared();
        dist_sq <= self.radius * self.radius
    }

    /// A box containing the whole cylinder. (Not necessarily the tightest one)
    pub fn bounding_box(&self) -> Aabb {
        if !(self.radius >= 0.0) {
            return Aabb::empty();
        }
        let r = vector![self.radius, self.radius, self.radius];
        let mut aabb = Aabb::empty();
        aabb.extend(&(self.start - r));
        aabb.extend(&(self.start + r));
        aabb.extend(&(self.end - r));
        aabb.extend(&(self.end + r));
        aabb
    }

    fn classify(&self, node: &Aabb) -> NodeQueryResult {
        if !self.bounding_box().intersects_aabb(node) {
            return NodeQueryResult::Negative;
        }
        // the cylinder is convex, so it contains the box iff it contains all corners
        let all_corners = (0..8).all(|corner| {
            let mut p = node.min;
            for axis in 0..3 {
                if corner & (1 << axis) != 0 {
                    p[axis] = node.max[axis];
                }
            }
            self.contains(&p)
        });
        if all_corners {
            NodeQueryResult::Positive
        } else {
            NodeQueryResult::Partial
        }
    }
}

impl Region {
    pub fn is_none(&self) -> bool {
        matches!(self, Region::None)
    }

    pub fn contains(&self, point: &PositionGlobal) -> bool {
        match self {
            Region::None => true,
            Region::Box(aabb) => aabb.contains(point),
            Region::Cylinder(cylinder) => cylinder.contains(point),
        }
    }

    /// Bounding box of the region. `None` for an unrestricted region.
    pub fn bounding_box(&self) -> Option<Aabb> {
        match self {
            Region::None => None,
            Region::Box(aabb) => Some(*aabb),
            Region::Cylinder(cylinder) => Some(cylinder.bounding_box()),
        }
    }

    /// Coarse test of a node box against the region.
    /// Never returns [NodeQueryResult::Negative] for a box that contains a point of the region.
    pub fn classify(&self, node: &Aabb) -> NodeQueryResult {
        match self {
            Region::None => NodeQueryResult::Positive,
            Region::Box(aabb) => classify_box(aabb, node),
            Region::Cylinder(cylinder) => cylinder.classify(node),
        }
    }

    pub fn intersects_box(&self, node: &Aabb) -> bool {
        self.classify(node) != NodeQueryResult::Negative
    }
}

/// Tests a node box against a query box.
pub(crate) fn classify_box(query: &Aabb, node: &Aabb) -> NodeQueryResult {
    if !query.intersects_aabb(node) {
        NodeQueryResult::Negative
    } else if query.contains_aabb(node) {
        NodeQueryResult::Positive
    } else {
        NodeQueryResult::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::point;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cylinder() -> Cylinder {
        Cylinder::new(point![0.0, 0.0, 0.0], point![10.0, 0.0, 0.0], 2.0)
    }

    #[test]
    fn cylinder_contains() {
        let c = cylinder();
        assert!(c.contains(&point![5.0, 1.0, 1.0]));
        assert!(c.contains(&point![0.0, 2.0, 0.0]));
        assert!(c.contains(&point![10.0, 0.0, -2.0]));
        assert!(!c.contains(&point![5.0, 1.5, 1.5]));
        assert!(!c.contains(&point![-0.1, 0.0, 0.0]));
        assert!(!c.contains(&point![10.1, 0.0, 0.0]));

        let degenerate = Cylinder::new(point![1.0, 1.0, 1.0], point![1.0, 1.0, 1.0], 5.0);
        assert!(!degenerate.contains(&point![1.0, 1.0, 1.0]));
    }

    #[test]
    fn cylinder_classify() {
        let c = cylinder();
        let inside = Aabb::new(point![2.0, -0.5, -0.5], point![8.0, 0.5, 0.5]);
        let partial = Aabb::new(point![2.0, 1.0, 1.0], point![8.0, 5.0, 5.0]);
        let outside = Aabb::new(point![2.0, 3.0, 0.0], point![8.0, 5.0, 1.0]);
        let region = Region::Cylinder(c);
        assert_eq!(region.classify(&inside), NodeQueryResult::Positive);
        assert_eq!(region.classify(&partial), NodeQueryResult::Partial);
        assert_eq!(region.classify(&outside), NodeQueryResult::Negative);
    }

    #[test]
    fn classify_never_prunes_matching_points() {
        let mut rng = StdRng::seed_from_u64(3);
        let regions = [
            Region::Box(Aabb::new(point![2.0, 3.0, 1.0], point![6.0, 4.0, 9.0])),
            Region::Cylinder(Cylinder::new(
                point![1.0, 1.0, 1.0],
                point![8.0, 6.0, 3.0],
                1.5,
            )),
        ];
        for region in regions {
            for _ in 0..500 {
                let a = point![rng.gen_range(0.0..10.0), rng.gen_range(0.0..10.0), rng.gen_range(0.0..10.0)];
                let mut node = Aabb::empty();
                node.extend(&a);
                node.extend(&(a + vector![rng.gen_range(0.0..3.0), rng.gen_range(0.0..3.0), rng.gen_range(0.0..3.0)]));
                let result = region.classify(&node);
                for _ in 0..20 {
                    let p = point![
                        rng.gen_range(node.min.x..=node.max.x),
                        rng.gen_range(node.min.y..=node.max.y),
                        rng.gen_range(node.min.z..=node.max.z)
                    ];
                    match result {
                        NodeQueryResult::Negative => assert!(!region.contains(&p)),
                        NodeQueryResult::Positive => assert!(region.contains(&p)),
                        NodeQueryResult::Partial => {}
                    }
                }
            }
        }
    }

    #[test]
    fn serde_tagging() {
        let region = Region::Box(Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 1.0, 1.0]));
        let json = serde_json::to_value(region).unwrap();
        assert_eq!(json["type"], "box");
        let back: Region = serde_json::from_value(json).unwrap();
        assert_eq!(back, region);
        let none: Region = serde_json::from_str(r#"{"type":"none"}"#).unwrap();
        assert!(none.is_none());
    }
}
