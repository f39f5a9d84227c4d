//! Filtering and streaming of points from the spatial index.

pub mod cursor;
pub mod filter;
pub mod region;

pub use cursor::{Query, QueryError, QueryState, QueryStateError};
pub use filter::{QueryFilter, ValueRange};
pub use region::{Cylinder, Region};

/// Describes, how an octree node matches a filter.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NodeQueryResult {
    /// No point in the node can match.
    /// Don't load the page, don't recurse into child nodes.
    Negative,

    /// Every point in the node matches.
    /// Accept all points of the page without further filtering.
    Positive,

    /// Some points in the node might match.
    /// Test each point of the page.
    Partial,
}

impl NodeQueryResult {
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (NodeQueryResult::Negative, _) | (_, NodeQueryResult::Negative) => {
                NodeQueryResult::Negative
            }
            (NodeQueryResult::Positive, NodeQueryResult::Positive) => NodeQueryResult::Positive,
            _ => NodeQueryResult::Partial,
        }
    }

    pub fn from_bool(matches: bool) -> Self {
        if matches {
            NodeQueryResult::Positive
        } else {
            NodeQueryResult::Negative
        }
    }
}
