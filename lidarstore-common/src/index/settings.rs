use super::SETTINGS_FILE_NAME;
use nalgebra::{vector, Vector3};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Parameters for building an index.
/// A copy is stored next to every index that was built with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Nodes with more points than this are split into octants.
    pub max_points_per_leaf: usize,

    /// Nodes at this depth are never split, regardless of their point count.
    pub max_tree_depth: u8,

    /// Upper bound for the memory used to buffer points during the build.
    /// Points beyond that are spilled to temporary files.
    pub buffer_size_bytes: usize,

    /// Resolution of the stored coordinates.
    pub scale: Vector3<f64>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        IndexSettings {
            max_points_per_leaf: 50_000,
            max_tree_depth: 16,
            buffer_size_bytes: 512 * 1024 * 1024,
            scale: vector![0.001, 0.001, 0.001],
        }
    }
}

#[derive(Error, Debug)]
pub enum IndexSettingIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerDe(#[from] serde_json::Error),
}

fn get_index_folder_settings_file(path: &Path) -> PathBuf {
    path.join(SETTINGS_FILE_NAME)
}

impl IndexSettings {
    pub fn load_from_file(file_name: &Path) -> Result<Self, IndexSettingIoError> {
        let file = File::open(file_name)?;
        let settings = serde_json::from_reader(file)?;
        Ok(settings)
    }

    pub fn load_from_index_folder(path: &Path) -> Result<Self, IndexSettingIoError> {
        Self::load_from_file(&get_index_folder_settings_file(path))
    }

    pub fn save_to_file(&self, file_name: &Path) -> Result<(), IndexSettingIoError> {
        let file = File::create(file_name)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn save_to_index_folder(&self, path: &Path) -> Result<(), IndexSettingIoError> {
        self.save_to_file(&get_index_folder_settings_file(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let settings = IndexSettings {
            max_points_per_leaf: 1234,
            ..Default::default()
        };
        settings.save_to_index_folder(dir.path()).unwrap();
        let loaded = IndexSettings::load_from_index_folder(dir.path()).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let settings: IndexSettings = serde_json::from_str(r#"{"max_tree_depth": 4}"#).unwrap();
        assert_eq!(settings.max_tree_depth, 4);
        assert_eq!(settings.max_points_per_leaf, 50_000);
    }
}
