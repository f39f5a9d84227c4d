use crate::index::settings::IndexSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session settings. Stored in the project file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorSettings {
    /// Maximum number of pages held in the tile cache.
    pub cache_size_maximum: usize,

    /// How long the background worker may hold the editor lock in one go.
    pub worker_time_budget_ms: u64,

    /// Used for datasets that have no index yet.
    pub index: IndexSettings,
}

impl Default for EditorSettings {
    fn default() -> Self {
        EditorSettings {
            cache_size_maximum: 256,
            worker_time_budget_ms: 20,
            index: IndexSettings::default(),
        }
    }
}

impl EditorSettings {
    pub fn worker_time_budget(&self) -> Duration {
        Duration::from_millis(self.worker_time_budget_ms.max(1))
    }
}
