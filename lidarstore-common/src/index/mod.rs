use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

pub mod builder;
pub mod page;
pub mod page_store;
pub mod settings;
pub mod spatial_index;

/// File names inside of an index directory.
pub const INDEX_FILE_NAME: &str = "index.bin";
pub const PAGES_FILE_NAME: &str = "pages.bin";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Identifies an open dataset within an editor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(pub u32);

/// Identifies a node within the spatial index of one dataset.
/// Node ids are dense: a dataset with `n` nodes uses the ids `0..n`, the root being `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Key of a page (tile), unique across all open datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub dataset: DatasetId,
    pub node: NodeId,
}

impl TileKey {
    pub fn new(dataset: DatasetId, node: NodeId) -> Self {
        TileKey { dataset, node }
    }
}

impl Display for DatasetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "dataset {}", self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {}", self.0)
    }
}

impl Display for TileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}", self.dataset, self.node)
    }
}

/// The directory holding the index of the point cloud file at `dataset_path`.
/// (`scan.las` is indexed into `scan.las.index/`)
pub fn index_dir_for(dataset_path: &Path) -> PathBuf {
    let mut name = dataset_path.as_os_str().to_owned();
    name.push(".index");
    PathBuf::from(name)
}
