use super::page::Page;
use super::spatial_index::{PageRef, SpatialIndexFile};
use super::{DatasetId, NodeId, TileKey, PAGES_FILE_NAME};
use crate::io::page_codec;
use crate::io::{IoError, PointIoError};
use crate::lru_cache::{CachedPage, PageLoader};
use crate::span;
use log::trace;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum PageStoreError {
    #[error("{0} is not open.")]
    UnknownDataset(DatasetId),

    #[error("There is no page for {0}. (Only leaf nodes have pages)")]
    NoPage(TileKey),

    #[error("I/O error on page {key}: {source}")]
    Io { key: TileKey, source: IoError },

    #[error("Page {key} is malformed: {source}")]
    Format { key: TileKey, source: PointIoError },

    #[error("Page {key} holds {actual} points, but its slot in the page file is sized for {expected}.")]
    PointCount {
        key: TileKey,
        expected: u64,
        actual: u64,
    },
}

struct DatasetPages {
    pages_file: PathBuf,
    index: Arc<SpatialIndexFile>,
}

/// Reads and writes whole pages from the page files of the open datasets.
///
/// There is no caching here, every read goes to disk. Errors are returned to the caller, no
/// operation is retried.
#[derive(Default)]
pub struct PageStore {
    datasets: HashMap<DatasetId, DatasetPages>,
}

impl PageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the pages of the index in `index_dir` available under the given dataset id.
    pub fn register(&mut self, dataset: DatasetId, index_dir: &Path, index: Arc<SpatialIndexFile>) {
        self.datasets.insert(
            dataset,
            DatasetPages {
                pages_file: index_dir.join(PAGES_FILE_NAME),
                index,
            },
        );
    }

    pub fn unregister(&mut self, dataset: DatasetId) {
        self.datasets.remove(&dataset);
    }

    pub fn is_registered(&self, dataset: DatasetId) -> bool {
        self.datasets.contains_key(&dataset)
    }

    fn locate(&self, key: TileKey) -> Result<(&DatasetPages, PageRef), PageStoreError> {
        let dataset = self
            .datasets
            .get(&key.dataset)
            .ok_or(PageStoreError::UnknownDataset(key.dataset))?;
        let page = dataset
            .index
            .page_ref_for(key.node)
            .ok_or(PageStoreError::NoPage(key))?;
        Ok((dataset, page))
    }

    pub fn read(&self, dataset: DatasetId, node: NodeId) -> Result<Page, PageStoreError> {
        let _span = span!("PageStore::read");
        let key = TileKey::new(dataset, node);
        let (pages, page_ref) = self.locate(key)?;
        let io_error = |e: std::io::Error| PageStoreError::Io {
            key,
            source: e.into(),
        };

        let mut file = File::open(&pages.pages_file).map_err(io_error)?;
        file.seek(SeekFrom::Start(page_ref.offset)).map_err(io_error)?;
        let mut data = vec![0; page_ref.length as usize];
        file.read_exact(&mut data).map_err(io_error)?;

        let columns = page_codec::read_page(&data, pages.index.coordinate_system())
            .map_err(|source| PageStoreError::Format { key, source })?;
        if columns.len() as u64 != page_ref.nr_points {
            return Err(PageStoreError::PointCount {
                key,
                expected: page_ref.nr_points,
                actual: columns.len() as u64,
            });
        }
        trace!("Read page {key} ({} points)", columns.len());
        Ok(Page::new(key, columns))
    }

    /// Writes the page back to its slot in the page file.
    /// The number of points can not change, since pages are stored back to back.
    pub fn write(&self, dataset: DatasetId, node: NodeId, page: &Page) -> Result<(), PageStoreError> {
        let _span = span!("PageStore::write");
        let key = TileKey::new(dataset, node);
        let (pages, page_ref) = self.locate(key)?;
        if page.len() as u64 != page_ref.nr_points {
            return Err(PageStoreError::PointCount {
                key,
                expected: page_ref.nr_points,
                actual: page.len() as u64,
            });
        }

        let mut data = Vec::with_capacity(page_ref.length as usize);
        page_codec::write_page(page.columns(), pages.index.coordinate_system(), &mut data)
            .map_err(|source| PageStoreError::Format { key, source })?;

        let io_error = |e: std::io::Error| PageStoreError::Io {
            key,
            source: e.into(),
        };
        let mut file = OpenOptions::new()
            .write(true)
            .open(&pages.pages_file)
            .map_err(io_error)?;
        file.seek(SeekFrom::Start(page_ref.offset)).map_err(io_error)?;
        file.write_all(&data).map_err(io_error)?;
        file.sync_data().map_err(io_error)?;
        trace!("Wrote page {key}");
        Ok(())
    }

    /// Tests, if the node is a leaf of a registered dataset, whose page is present in the page file.
    pub fn exists(&self, dataset: DatasetId, node: NodeId) -> bool {
        let Ok((pages, page_ref)) = self.locate(TileKey::new(dataset, node)) else {
            return false;
        };
        match std::fs::metadata(&pages.pages_file) {
            Ok(meta) => meta.len() >= page_ref.offset + page_ref.length,
            Err(_) => false,
        }
    }
}

impl CachedPage for Page {
    fn is_dirty(&self) -> bool {
        Page::is_dirty(self)
    }

    fn mark_clean(&mut self) {
        Page::mark_clean(self)
    }
}

impl PageLoader for PageStore {
    type Key = TileKey;
    type Data = Page;
    type Error = PageStoreError;

    fn load(&self, key: &Self::Key) -> Result<Self::Data, Self::Error> {
        self.read(key.dataset, key.node)
    }

    fn store(&self, key: &Self::Key, data: &Self::Data) -> Result<(), Self::Error> {
        self.write(key.dataset, key.node, data)
    }

    fn exists(&self, key: &Self::Key) -> bool {
        PageStore::exists(self, key.dataset, key.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::coordinate_system::CoordinateSystem;
    use crate::index::INDEX_FILE_NAME;
    use crate::point::classification;
    use crate::test_utils::{build_index, random_points, test_settings};

    fn setup() -> (tempfile::TempDir, PathBuf, Arc<SpatialIndexFile>, PageStore) {
        let dir = tempfile::tempdir().unwrap();
        let points = random_points(2000, 11, &CoordinateSystem::new_identity());
        let (index_dir, index) = build_index(dir.path(), "idx", &points, test_settings(200));
        let index = Arc::new(index);
        let mut store = PageStore::new();
        store.register(DatasetId(1), &index_dir, Arc::clone(&index));
        (dir, index_dir, index, store)
    }

    fn first_nonempty_leaf(index: &SpatialIndexFile) -> NodeId {
        index
            .leaves()
            .find(|l| l.page_ref().unwrap().nr_points > 0)
            .unwrap()
            .id
    }

    #[test]
    fn write_then_read_is_identical() {
        let (_dir, _, index, store) = setup();
        let leaf = first_nonempty_leaf(&index);

        let mut page = store.read(DatasetId(1), leaf).unwrap();
        for c in page.columns_mut().classification.iter_mut() {
            *c = classification::GROUND;
        }
        page.columns_mut().descriptor[0] = Some(0.25);
        store.write(DatasetId(1), leaf, &page).unwrap();

        let reread = store.read(DatasetId(1), leaf).unwrap();
        assert_eq!(reread.columns(), page.columns());
        assert!(!reread.is_dirty());

        // neighbouring pages are unaffected
        let other = index.leaves().map(|l| l.id).find(|id| *id != leaf).unwrap();
        let other_page = store.read(DatasetId(1), other).unwrap();
        assert_eq!(other_page.len() as u64, index.page_ref_for(other).unwrap().nr_points);
    }

    #[test]
    fn unknown_dataset_and_inner_nodes() {
        let (_dir, _, index, store) = setup();
        assert!(matches!(
            store.read(DatasetId(7), NodeId(0)),
            Err(PageStoreError::UnknownDataset(DatasetId(7)))
        ));
        assert!(!index.root().is_leaf());
        assert!(matches!(
            store.read(DatasetId(1), NodeId::ROOT),
            Err(PageStoreError::NoPage(_))
        ));
        assert!(!store.exists(DatasetId(1), NodeId::ROOT));
        assert!(store.exists(DatasetId(1), first_nonempty_leaf(&index)));
    }

    #[test]
    fn short_read_is_an_io_error() {
        let (_dir, index_dir, index, store) = setup();
        let last = index
            .leaves()
            .max_by_key(|l| l.page_ref().unwrap().offset)
            .unwrap()
            .id;
        let pages_path = index_dir.join(PAGES_FILE_NAME);
        let len = std::fs::metadata(&pages_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&pages_path).unwrap();
        file.set_len(len - 1).unwrap();

        assert!(!store.exists(DatasetId(1), last));
        assert!(matches!(
            store.read(DatasetId(1), last),
            Err(PageStoreError::Io { .. })
        ));
    }

    #[test]
    fn missing_page_file_is_an_io_error() {
        let (_dir, index_dir, index, store) = setup();
        std::fs::remove_file(index_dir.join(PAGES_FILE_NAME)).unwrap();
        assert!(index_dir.join(INDEX_FILE_NAME).exists());
        let leaf = first_nonempty_leaf(&index);
        assert!(matches!(
            store.read(DatasetId(1), leaf),
            Err(PageStoreError::Io { .. })
        ));
    }

    #[test]
    fn point_count_can_not_change() {
        let (_dir, _, index, store) = setup();
        let leaf = first_nonempty_leaf(&index);
        let page = store.read(DatasetId(1), leaf).unwrap();
        let truncated = Page::from_points(page.key(), &page.points().skip(1).collect::<Vec<_>>());
        assert!(matches!(
            store.write(DatasetId(1), leaf, &truncated),
            Err(PageStoreError::PointCount { .. })
        ));
    }
}
