use super::region::{classify_box, Region};
use super::NodeQueryResult;
use crate::geometry::bounding_box::Aabb;
use crate::point::PointRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Inclusive range of attribute values.
/// A range with `min > max` is empty and matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> ValueRange<T> {
    pub fn new(min: T, max: T) -> Self {
        ValueRange { min, max }
    }

    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }

    pub fn is_empty(&self) -> bool {
        !(self.min <= self.max)
    }

    /// How the range relates to all values in `[lo, hi]`.
    fn classify(&self, lo: T, hi: T) -> NodeQueryResult {
        if self.is_empty() || hi < self.min || lo > self.max {
            NodeQueryResult::Negative
        } else if self.min <= lo && hi <= self.max {
            NodeQueryResult::Positive
        } else {
            NodeQueryResult::Partial
        }
    }
}

/// Predicate over points, combining a spatial region with attribute tests.
///
/// All parts are ANDed. Unset ranges and empty sets do not restrict anything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilter {
    pub region: Region,

    /// Additional box, that the region is clipped to (the viewport).
    pub clip: Option<Aabb>,

    /// Range of the z coordinate.
    pub elevation: Option<ValueRange<f64>>,
    pub intensity: Option<ValueRange<u16>>,

    /// Range of the descriptor. Points without a descriptor never match a descriptor range.
    pub descriptor: Option<ValueRange<f32>>,
    pub classifications: BTreeSet<u8>,
    pub species: BTreeSet<u32>,
    pub management_status: BTreeSet<u32>,

    /// Visible layers.
    pub layers: BTreeSet<u32>,
}

impl QueryFilter {
    /// The filter that matches every point.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    pub fn with_clip(mut self, clip: Aabb) -> Self {
        self.clip = Some(clip);
        self
    }

    pub fn with_elevation(mut self, min: f64, max: f64) -> Self {
        self.elevation = Some(ValueRange::new(min, max));
        self
    }

    pub fn with_intensity(mut self, min: u16, max: u16) -> Self {
        self.intensity = Some(ValueRange::new(min, max));
        self
    }

    pub fn with_descriptor(mut self, min: f32, max: f32) -> Self {
        self.descriptor = Some(ValueRange::new(min, max));
        self
    }

    pub fn with_classifications(mut self, classes: impl IntoIterator<Item = u8>) -> Self {
        self.classifications = classes.into_iter().collect();
        self
    }

    pub fn with_species(mut self, species: impl IntoIterator<Item = u32>) -> Self {
        self.species = species.into_iter().collect();
        self
    }

    pub fn with_management_status(mut self, status: impl IntoIterator<Item = u32>) -> Self {
        self.management_status = status.into_iter().collect();
        self
    }

    pub fn with_layers(mut self, layers: impl IntoIterator<Item = u32>) -> Self {
        self.layers = layers.into_iter().collect();
        self
    }

    /// True, if the filter puts no restrictions on per-point attributes
    /// (Only the region, clip box and elevation are set, which can be tested on node boxes.)
    fn is_spatial_only(&self) -> bool {
        self.intensity.is_none()
            && self.descriptor.is_none()
            && self.classifications.is_empty()
            && self.species.is_empty()
            && self.management_status.is_empty()
            && self.layers.is_empty()
    }

    pub fn matches(&self, point: &PointRecord) -> bool {
        let position = &point.position;
        if !self.region.contains(position) {
            return false;
        }
        if let Some(clip) = &self.clip {
            if !clip.contains(position) {
                return false;
            }
        }
        if let Some(range) = &self.elevation {
            if !range.contains(position.z) {
                return false;
            }
        }
        if let Some(range) = &self.intensity {
            if !range.contains(point.intensity) {
                return false;
            }
        }
        if let Some(range) = &self.descriptor {
            match point.descriptor {
                Some(d) if range.contains(d) => {}
                _ => return false,
            }
        }
        set_allows(&self.classifications, &point.classification)
            && set_allows(&self.species, &point.species)
            && set_allows(&self.management_status, &point.management_status)
            && set_allows(&self.layers, &point.layer)
    }

    /// Tests a node box.
    ///
    /// [NodeQueryResult::Negative] is only returned, if no point inside the box can match.
    /// [NodeQueryResult::Positive] is only returned, if every point inside the box matches.
    pub fn classify_node(&self, node: &Aabb) -> NodeQueryResult {
        let mut result = self.region.classify(node);
        if let Some(clip) = &self.clip {
            result = result.and(classify_box(clip, node));
        }
        if let Some(range) = &self.elevation {
            result = result.and(range.classify(node.min.z, node.max.z));
        }
        if result == NodeQueryResult::Negative {
            return result;
        }

        // attribute tests can only be decided per point,
        // except for empty ranges, which never match
        let empty_range = self.intensity.is_some_and(|r| r.is_empty())
            || self.descriptor.is_some_and(|r| r.is_empty());
        if empty_range {
            NodeQueryResult::Negative
        } else if self.is_spatial_only() {
            result
        } else {
            result.and(NodeQueryResult::Partial)
        }
    }

    /// Coarse test used for pruning: False, only if no point in the box can match.
    pub fn intersects_box(&self, node: &Aabb) -> bool {
        self.classify_node(node) != NodeQueryResult::Negative
    }
}

fn set_allows<T: Ord>(set: &BTreeSet<T>, value: &T) -> bool {
    set.is_empty() || set.contains(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::classification;
    use crate::query::region::Cylinder;
    use nalgebra::point;

    fn point_at(x: f64, y: f64, z: f64) -> PointRecord {
        PointRecord {
            intensity: 150,
            classification: classification::GROUND,
            descriptor: Some(0.5),
            species: 3,
            layer: 1,
            ..PointRecord::at(point![x, y, z])
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = QueryFilter::new();
        assert!(f.matches(&point_at(-1e9, 3.0, 1e9)));
        let node = Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 1.0, 1.0]);
        assert_eq!(f.classify_node(&node), NodeQueryResult::Positive);
    }

    #[test]
    fn attribute_tests() {
        let p = point_at(1.0, 1.0, 1.0);
        assert!(QueryFilter::new().with_intensity(100, 200).matches(&p));
        assert!(QueryFilter::new().with_intensity(150, 150).matches(&p));
        assert!(!QueryFilter::new().with_intensity(151, 200).matches(&p));
        assert!(QueryFilter::new().with_descriptor(0.0, 0.5).matches(&p));
        assert!(!QueryFilter::new().with_descriptor(0.0, 0.5).matches(&PointRecord {
            descriptor: None,
            ..p.clone()
        }));
        assert!(QueryFilter::new().with_classifications([1, 2]).matches(&p));
        assert!(!QueryFilter::new().with_classifications([1]).matches(&p));
        assert!(QueryFilter::new().with_species([3]).matches(&p));
        assert!(!QueryFilter::new().with_management_status([7]).matches(&p));
        assert!(!QueryFilter::new().with_layers([0, 2]).matches(&p));
        assert!(QueryFilter::new().with_elevation(1.0, 1.0).matches(&p));
    }

    #[test]
    fn inverted_ranges_match_nothing() {
        let p = point_at(1.0, 1.0, 1.0);
        let node = Aabb::new(point![0.0, 0.0, 0.0], point![2.0, 2.0, 2.0]);
        for f in [
            QueryFilter::new().with_intensity(200, 100),
            QueryFilter::new().with_elevation(2.0, 0.0),
            QueryFilter::new().with_descriptor(1.0, 0.0),
        ] {
            assert!(!f.matches(&p));
            assert_eq!(f.classify_node(&node), NodeQueryResult::Negative);
            assert!(!f.intersects_box(&node));
        }
    }

    #[test]
    fn region_and_clip() {
        let f = QueryFilter::new()
            .with_region(Region::Cylinder(Cylinder::new(
                point![0.0, 0.0, 0.0],
                point![0.0, 0.0, 10.0],
                5.0,
            )))
            .with_clip(Aabb::new(point![0.0, 0.0, 0.0], point![10.0, 10.0, 10.0]));
        assert!(f.matches(&point_at(3.0, 3.0, 5.0)));
        assert!(!f.matches(&point_at(-3.0, 3.0, 5.0)));
        assert!(!f.matches(&point_at(4.0, 4.0, 5.0)));

        let far = Aabb::new(point![20.0, 20.0, 0.0], point![30.0, 30.0, 10.0]);
        assert_eq!(f.classify_node(&far), NodeQueryResult::Negative);
        let inside = Aabb::new(point![1.0, 1.0, 1.0], point![2.0, 2.0, 2.0]);
        assert_eq!(f.classify_node(&inside), NodeQueryResult::Positive);
        let outside_clip = Aabb::new(point![-2.0, 1.0, 1.0], point![-1.0, 2.0, 2.0]);
        assert_eq!(f.classify_node(&outside_clip), NodeQueryResult::Negative);
    }

    #[test]
    fn attribute_filters_make_nodes_partial() {
        let node = Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 1.0, 1.0]);
        let f = QueryFilter::new().with_classifications([2]);
        assert_eq!(f.classify_node(&node), NodeQueryResult::Partial);
        let f = QueryFilter::new().with_elevation(0.0, 10.0);
        assert_eq!(f.classify_node(&node), NodeQueryResult::Positive);
        let f = QueryFilter::new().with_elevation(0.5, 10.0);
        assert_eq!(f.classify_node(&node), NodeQueryResult::Partial);
    }

    #[test]
    fn deserialize_partial_json() {
        let f: QueryFilter =
            serde_json::from_str(r#"{"intensity": {"min": 100, "max": 200}, "classifications": [2]}"#)
                .unwrap();
        assert_eq!(f.intensity, Some(ValueRange::new(100, 200)));
        assert!(f.region.is_none());
        assert_eq!(f.classifications.len(), 1);
    }
}
