use crate::geometry::bounding_box::Aabb;
use crate::index::spatial_index::SpatialIndexFile;
use crate::index::DatasetId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// An open point cloud.
pub struct Dataset {
    pub(super) id: DatasetId,
    pub(super) path: PathBuf,
    pub(super) index_dir: PathBuf,
    pub(super) index: Arc<SpatialIndexFile>,
    pub(super) label: String,
    pub(super) visible: bool,
    pub(super) enabled: bool,

    /// Unix timestamp (seconds)
    pub(super) created: u64,
}

/// Snapshot of the state of a dataset, as returned by [super::Editor::datasets].
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetInfo {
    pub id: DatasetId,
    pub path: PathBuf,
    pub label: String,
    pub nr_points: u64,
    pub bounds: Aabb,
    pub visible: bool,
    pub enabled: bool,
    pub created: u64,
}

impl Dataset {
    pub(super) fn new(id: DatasetId, path: PathBuf, index_dir: PathBuf, index: SpatialIndexFile) -> Self {
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Dataset {
            id,
            path,
            index_dir,
            index: Arc::new(index),
            label,
            visible: true,
            enabled: true,
            created: unix_now(),
        }
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    /// The point cloud file, that the dataset was imported from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn index(&self) -> &Arc<SpatialIndexFile> {
        &self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn bounds(&self) -> &Aabb {
        self.index.bounds()
    }

    pub fn info(&self) -> DatasetInfo {
        DatasetInfo {
            id: self.id,
            path: self.path.clone(),
            label: self.label.clone(),
            nr_points: self.index.nr_points(),
            bounds: *self.index.bounds(),
            visible: self.visible,
            enabled: self.enabled,
            created: self.created,
        }
    }
}

pub(super) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
