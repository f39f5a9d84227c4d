//! The editing session: open datasets, the tile cache, the current filter and the background worker.
//!
//! All shared state lives in [EditorState] behind a single mutex ([Editor::lock]). Whoever holds the
//! lock may read and modify datasets, pages and queries. The background worker takes the lock for
//! one time slice at a time, so foreground calls only ever wait for the rest of one slice.

pub mod dataset;
pub mod events;
pub mod project;
pub mod settings;
mod worker;

use crate::action::{Action, ActionError};
use crate::geometry::bounding_box::Aabb;
use crate::index::builder::{BuildError, IndexBuilder};
use crate::index::page_store::{PageStore, PageStoreError};
use crate::index::spatial_index::{IndexOpenError, NodeTraversal, SpatialIndexFile};
use crate::index::{index_dir_for, DatasetId, TileKey, INDEX_FILE_NAME};
use crate::lru_cache::tile_cache::TileCache;
use crate::point::PointRecord;
use crate::query::{NodeQueryResult, Query, QueryError, QueryFilter, Region};
use crate::span;
use crossbeam_channel::Receiver;
use dataset::{Dataset, DatasetInfo};
use events::{EditorEvent, EventBus};
use log::{debug, error, info};
use project::{project_dir, relative_path, resolve_path, ProjectDataset, ProjectError, ProjectFile};
use serde_json::Value;
use settings::EditorSettings;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use worker::{Task, ViewportTask, Worker};

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("{0} is not open.")]
    UnknownDataset(DatasetId),

    #[error("Could not build the index of {path}: {source}")]
    Build { path: PathBuf, source: BuildError },

    #[error("Could not open the index in {path}: {source}")]
    Open {
        path: PathBuf,
        source: IndexOpenError,
    },

    #[error(transparent)]
    Page(#[from] PageStoreError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Project(#[from] ProjectError),
}

/// Everything protected by the editor lock.
pub struct EditorState {
    datasets: Vec<Dataset>,
    cache: TileCache<PageStore>,
    filter: QueryFilter,
    viewport: Option<Aabb>,
    settings: EditorSettings,
    view: Value,
    units: Value,
    next_dataset_id: u32,
    events: EventBus,
}

impl EditorState {
    pub(crate) fn new(settings: EditorSettings, events: EventBus) -> Self {
        EditorState {
            datasets: Vec::new(),
            cache: TileCache::new(PageStore::new(), settings.cache_size_maximum),
            filter: QueryFilter::default(),
            viewport: None,
            settings,
            view: Value::Null,
            units: Value::Null,
            next_dataset_id: 0,
            events,
        }
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn dataset(&self, id: DatasetId) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.id == id)
    }

    fn dataset_mut(&mut self, id: DatasetId) -> Result<&mut Dataset, EditorError> {
        self.datasets
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(EditorError::UnknownDataset(id))
    }

    pub fn cache(&self) -> &TileCache<PageStore> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut TileCache<PageStore> {
        &mut self.cache
    }

    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    pub fn viewport(&self) -> Option<&Aabb> {
        self.viewport.as_ref()
    }

    pub fn settings(&self) -> &EditorSettings {
        &self.settings
    }

    /// View settings of the user interface, as loaded from the project file.
    pub fn view(&self) -> &Value {
        &self.view
    }

    pub fn set_view(&mut self, view: Value) {
        self.view = view;
    }

    pub fn units(&self) -> &Value {
        &self.units
    }

    pub fn set_units(&mut self, units: Value) {
        self.units = units;
    }

    pub fn emit(&self, event: EditorEvent) {
        self.events.emit(event)
    }

    /// The datasets that queries, edits and actions work on: those that are both visible and enabled.
    pub fn active_datasets(&self) -> Vec<(DatasetId, Arc<SpatialIndexFile>)> {
        self.datasets
            .iter()
            .filter(|d| d.visible && d.enabled)
            .map(|d| (d.id, Arc::clone(&d.index)))
            .collect()
    }

    /// The query for the current viewport, or `None` if no viewport is set.
    /// The clip box of the current filter is replaced by the viewport.
    pub fn viewport_query(&self) -> Option<Query> {
        let viewport = self.viewport?;
        let filter = QueryFilter {
            clip: Some(viewport),
            ..self.filter.clone()
        };
        Some(Query::with_filter(filter, self.active_datasets()))
    }

    fn apply_settings(&mut self, settings: EditorSettings) -> Result<(), EditorError> {
        self.cache.set_capacity(settings.cache_size_maximum)?;
        self.settings = settings;
        Ok(())
    }

    pub(crate) fn add_dataset(&mut self, path: PathBuf, index_dir: PathBuf, index: SpatialIndexFile) -> DatasetId {
        let id = DatasetId(self.next_dataset_id);
        self.next_dataset_id += 1;
        let dataset = Dataset::new(id, path, index_dir, index);
        self.cache
            .loader_mut()
            .register(id, &dataset.index_dir, Arc::clone(&dataset.index));
        info!(
            "Opened {} as {id} ({} points).",
            dataset.path.display(),
            dataset.index.nr_points()
        );
        self.datasets.push(dataset);
        id
    }

    fn remove_dataset(&mut self, id: DatasetId) -> Result<(), EditorError> {
        if self.dataset(id).is_none() {
            return Err(EditorError::UnknownDataset(id));
        }
        self.cache.invalidate(id)?;
        self.cache.loader_mut().unregister(id);
        self.datasets.retain(|d| d.id != id);
        info!("Closed {id}.");
        Ok(())
    }

    /// Applies `modify` to every point of the active datasets that matches the filter.
    /// Changed pages are marked dirty in the cache. Returns the number of changed points.
    pub fn modify_points(
        &mut self,
        filter: &QueryFilter,
        mut modify: impl FnMut(&mut PointRecord),
    ) -> Result<u64, EditorError> {
        let _span = span!("EditorState::modify_points");
        let mut nr_changed = 0;
        for (dataset, index) in self.active_datasets() {
            let mut traversal = NodeTraversal::new();
            while let Some(id) = traversal.next_leaf(&index, |n| filter.intersects_box(&n.bounds)) {
                let Some(node) = index.node(id) else {
                    continue;
                };
                if node.page_ref().map_or(true, |p| p.nr_points == 0) {
                    continue;
                }
                let accept_all = filter.classify_node(&node.bounds) == NodeQueryResult::Positive;
                let page = self.cache.get_mut(&TileKey::new(dataset, id))?;
                for i in 0..page.len() {
                    let mut point = page.point(i);
                    if accept_all || filter.matches(&point) {
                        modify(&mut point);
                        if page.update_point(i, &point) {
                            nr_changed += 1;
                        }
                    }
                }
            }
        }
        Ok(nr_changed)
    }
}

/// The editing session.
///
/// Methods of the editor take the lock themselves. They must not be called while the calling
/// thread holds the guard returned by [Editor::lock].
pub struct Editor {
    state: Arc<Mutex<EditorState>>,
    events: EventBus,
    worker: Worker,
}

impl Default for Editor {
    fn default() -> Self {
        Self::new(EditorSettings::default())
    }
}

impl Editor {
    pub fn new(settings: EditorSettings) -> Self {
        let events = EventBus::new();
        let state = Arc::new(Mutex::new(EditorState::new(settings, events.clone())));
        let worker = Worker::spawn(Arc::clone(&state));
        Editor {
            state,
            events,
            worker,
        }
    }

    /// Acquires the editor lock. It is released when the guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, EditorState> {
        self.state.lock().unwrap()
    }

    pub fn subscribe(&self) -> Receiver<EditorEvent> {
        self.events.subscribe()
    }

    /// Opens a point cloud file. If it has not been indexed yet, the index is built first.
    pub fn open(&self, path: &Path) -> Result<DatasetId, EditorError> {
        let index_dir = index_dir_for(path);
        let index = if index_dir.join(INDEX_FILE_NAME).is_file() {
            open_index_file(&index_dir)?
        } else {
            let settings = self.lock().settings.index.clone();
            info!("{} has no index yet. Building it.", path.display());
            IndexBuilder::new(settings)
                .build_from_las(path, &index_dir)
                .map_err(|source| EditorError::Build {
                    path: path.to_path_buf(),
                    source,
                })?
        };
        Ok(self.reconfigure(|state| {
            let id = state.add_dataset(path.to_path_buf(), index_dir, index);
            state.emit(EditorEvent::DatasetsChanged);
            id
        }))
    }

    /// Opens an index directory, that has been built before.
    pub fn open_index(&self, index_dir: &Path) -> Result<DatasetId, EditorError> {
        let index = open_index_file(index_dir)?;
        let path = if index_dir.extension().is_some_and(|e| e == "index") {
            index_dir.with_extension("")
        } else {
            index_dir.to_path_buf()
        };
        Ok(self.reconfigure(|state| {
            let id = state.add_dataset(path, index_dir.to_path_buf(), index);
            state.emit(EditorEvent::DatasetsChanged);
            id
        }))
    }

    /// Closes all datasets. Dirty pages are written back first.
    pub fn close(&self) -> Result<(), EditorError> {
        self.cancel_threads();
        let mut state = self.lock();
        let ids = state.datasets.iter().map(|d| d.id).collect::<Vec<_>>();
        let result = ids.into_iter().try_for_each(|id| state.remove_dataset(id));
        state.emit(EditorEvent::DatasetsChanged);
        result
    }

    pub fn remove_dataset(&self, id: DatasetId) -> Result<(), EditorError> {
        self.reconfigure(|state| {
            state.remove_dataset(id)?;
            state.emit(EditorEvent::DatasetsChanged);
            Ok(())
        })
    }

    pub fn datasets(&self) -> Vec<DatasetInfo> {
        self.lock().datasets.iter().map(Dataset::info).collect()
    }

    pub fn set_dataset_visible(&self, id: DatasetId, visible: bool) -> Result<(), EditorError> {
        self.reconfigure(|state| {
            state.dataset_mut(id)?.visible = visible;
            state.emit(EditorEvent::DatasetsChanged);
            Ok(())
        })
    }

    pub fn set_dataset_enabled(&self, id: DatasetId, enabled: bool) -> Result<(), EditorError> {
        self.reconfigure(|state| {
            state.dataset_mut(id)?.enabled = enabled;
            state.emit(EditorEvent::DatasetsChanged);
            Ok(())
        })
    }

    pub fn set_filter(&self, filter: QueryFilter) {
        self.reconfigure(|state| state.filter = filter)
    }

    /// Replaces the region of the current filter.
    pub fn set_region(&self, region: Region) {
        self.reconfigure(|state| state.filter.region = region)
    }

    /// Sets the visible part of the scene. The points within are streamed to the subscribers as
    /// [EditorEvent::ViewportPoints]. `None` stops streaming.
    pub fn set_viewport(&self, viewport: Option<Aabb>) {
        self.reconfigure(|state| state.viewport = viewport)
    }

    pub fn set_cache_size(&self, cache_size_maximum: usize) -> Result<(), EditorError> {
        let mut state = self.lock();
        state.cache.set_capacity(cache_size_maximum)?;
        state.settings.cache_size_maximum = cache_size_maximum;
        Ok(())
    }

    /// Stops whatever the background worker is doing and waits until it has released its pins.
    pub fn cancel_threads(&self) {
        self.worker.cancel();
    }

    /// Cancels the background work and restarts streaming of the current viewport.
    /// A running action is not restarted.
    pub fn restart_threads(&self) {
        self.worker.cancel();
        let query = self.lock().viewport_query();
        if let Some(query) = query {
            debug!("Restarting viewport query.");
            self.worker.start(Task::Viewport(ViewportTask::new(query)));
        }
    }

    /// Blocks until the background worker has nothing left to do.
    pub fn wait_idle(&self) {
        self.worker.wait_idle();
    }

    pub fn is_busy(&self) -> bool {
        !self.worker.is_idle()
    }

    fn reconfigure<T>(&self, change: impl FnOnce(&mut EditorState) -> T) -> T {
        self.cancel_threads();
        let result = change(&mut *self.lock());
        self.restart_threads();
        result
    }

    /// Sets the classification of all points matching the filter.
    pub fn classify_points(&self, filter: &QueryFilter, classification: u8) -> Result<u64, EditorError> {
        self.modify_points(filter, |p| p.classification = classification)
    }

    /// Applies `modify` to all points matching the filter.
    /// The position of points can not be changed, changes to it are ignored.
    pub fn modify_points(
        &self,
        filter: &QueryFilter,
        modify: impl FnMut(&mut PointRecord),
    ) -> Result<u64, EditorError> {
        let nr_changed = self.lock().modify_points(filter, modify)?;
        info!("Modified {nr_changed} points.");
        self.restart_threads();
        Ok(nr_changed)
    }

    /// Writes all modified pages to disk.
    pub fn flush(&self) -> Result<usize, EditorError> {
        let nr_pages = self.lock().cache.flush()?;
        debug!("Flushed {nr_pages} pages.");
        Ok(nr_pages)
    }

    /// Validates the parameters and runs the action on the background worker.
    /// Progress is reported as [EditorEvent::ActionProgress], completion as [EditorEvent::ActionFinished].
    /// If another task replaces it first, [EditorEvent::ActionCancelled] is sent instead.
    pub fn run_action(&self, mut action: Action, parameters: Value) -> Result<(), EditorError> {
        self.cancel_threads();
        action.apply_parameters(parameters, &self.lock())?;
        info!("Running action {}.", action.name());
        self.worker.start(Task::Action(action));
        Ok(())
    }

    pub fn save_project(&self, path: &Path) -> Result<(), EditorError> {
        let base = project_dir(path);
        let project = {
            let state = self.lock();
            ProjectFile {
                datasets: state
                    .datasets
                    .iter()
                    .map(|d| ProjectDataset {
                        path: relative_path(&base, &d.path),
                        label: d.label.clone(),
                        visible: d.visible,
                        enabled: d.enabled,
                        created: d.created,
                    })
                    .collect(),
                settings: state.settings.clone(),
                view: state.view.clone(),
                units: state.units.clone(),
            }
        };
        project.save(path)?;
        info!("Saved project {}.", path.display());
        Ok(())
    }

    /// Replaces the current session with the one stored in the project file.
    pub fn open_project(&self, path: &Path) -> Result<Vec<DatasetId>, EditorError> {
        let project = ProjectFile::load(path)?;
        self.close()?;
        {
            let mut state = self.lock();
            state.apply_settings(project.settings)?;
            state.view = project.view;
            state.units = project.units;
        }

        let base = project_dir(path);
        let mut ids = Vec::with_capacity(project.datasets.len());
        for entry in project.datasets {
            let id = self.open(&resolve_path(&base, &entry.path))?;
            let mut state = self.lock();
            let dataset = state.dataset_mut(id)?;
            if !entry.label.is_empty() {
                dataset.label = entry.label;
            }
            if entry.created != 0 {
                dataset.created = entry.created;
            }
            dataset.visible = entry.visible;
            dataset.enabled = entry.enabled;
            ids.push(id);
        }
        self.lock().emit(EditorEvent::DatasetsChanged);
        self.restart_threads();
        info!("Opened project {}.", path.display());
        Ok(ids)
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        self.worker.stop();
        if let Err(e) = self.flush() {
            error!("Failed to write back modified pages: {e}");
        }
    }
}

fn open_index_file(index_dir: &Path) -> Result<SpatialIndexFile, EditorError> {
    SpatialIndexFile::open(&index_dir.join(INDEX_FILE_NAME)).map_err(|source| EditorError::Open {
        path: index_dir.to_path_buf(),
        source,
    })
}
