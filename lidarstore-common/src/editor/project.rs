//! The json project file.

use super::settings::EditorSettings;
use crate::io::IoError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Could not access project file {path}: {source}")]
    Io { path: PathBuf, source: IoError },

    #[error("Malformed project file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDataset {
    /// Relative to the directory of the project file, unless that was not possible.
    pub path: PathBuf,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub created: u64,
}

fn default_true() -> bool {
    true
}

/// Contents of a project file.
///
/// `view` and `units` belong to the user interface. They are not interpreted here, just kept.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectFile {
    pub datasets: Vec<ProjectDataset>,
    pub settings: EditorSettings,
    pub view: Value,
    pub units: Value,
}

impl ProjectFile {
    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let file = File::open(path).map_err(|e| ProjectError::Io {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ProjectError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ProjectError> {
        let io_error = |e: std::io::Error| ProjectError::Io {
            path: path.to_path_buf(),
            source: e.into(),
        };
        let file = File::create(path).map_err(io_error)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|source| ProjectError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(io_error)?;
        Ok(())
    }
}

/// Directory that dataset paths in the given project file are relative to.
pub fn project_dir(project_file: &Path) -> PathBuf {
    match project_file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Makes `path` relative to `base`, if `path` is inside of `base`.
pub fn relative_path(base: &Path, path: &Path) -> PathBuf {
    let base = absolute(base);
    let full = absolute(path);
    match full.strip_prefix(&base) {
        Ok(relative) if relative.components().all(|c| matches!(c, Component::Normal(_))) => {
            relative.to_path_buf()
        }
        _ => path.to_path_buf(),
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Resolves a dataset path from a project file.
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relative_paths() {
        let base = Path::new("/data/projects");
        assert_eq!(
            relative_path(base, Path::new("/data/projects/scans/a.las")),
            PathBuf::from("scans/a.las")
        );
        assert_eq!(
            relative_path(base, Path::new("/elsewhere/b.las")),
            PathBuf::from("/elsewhere/b.las")
        );
        assert_eq!(
            resolve_path(base, Path::new("scans/a.las")),
            PathBuf::from("/data/projects/scans/a.las")
        );
        assert_eq!(
            resolve_path(base, Path::new("/elsewhere/b.las")),
            PathBuf::from("/elsewhere/b.las")
        );
    }

    #[test]
    fn unknown_parts_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        let json = json!({
            "datasets": [{"path": "a.las", "label": "A", "visible": false, "created": 1700000000}],
            "settings": {"cache_size_maximum": 12},
            "view": {"point_size": 3, "color_source": "classification"},
            "units": {"scale": 0.3048}
        });
        std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();

        let project = ProjectFile::load(&path).unwrap();
        assert_eq!(project.datasets[0].label, "A");
        assert!(!project.datasets[0].visible);
        assert!(project.datasets[0].enabled);
        assert_eq!(project.settings.cache_size_maximum, 12);
        assert_eq!(project.settings.worker_time_budget_ms, 20);

        project.save(&path).unwrap();
        let reloaded = ProjectFile::load(&path).unwrap();
        assert_eq!(reloaded, project);
        assert_eq!(reloaded.view["color_source"], "classification");
        assert_eq!(reloaded.units["scale"], 0.3048);
    }

    #[test]
    fn malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        std::fs::write(&path, "{\"datasets\": 5}").unwrap();
        assert!(matches!(ProjectFile::load(&path), Err(ProjectError::Json { .. })));
        assert!(matches!(
            ProjectFile::load(&dir.path().join("missing.json")),
            Err(ProjectError::Io { .. })
        ));
    }
}
