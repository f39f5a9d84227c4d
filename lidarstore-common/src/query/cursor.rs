use super::filter::QueryFilter;
use super::NodeQueryResult;
use crate::index::page::Page;
use crate::index::page_store::PageStoreError;
use crate::index::spatial_index::{NodeTraversal, SpatialIndexFile};
use crate::index::{DatasetId, TileKey};
use crate::lru_cache::tile_cache::TileCache;
use crate::lru_cache::PageLoader;
use crate::point::PointRecord;
use crate::span;
use log::debug;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueryState {
    /// Not executed yet. Filter and datasets can be changed.
    New,
    Running,
    /// All points have been returned.
    Exhausted,
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryStateError {
    #[error("The query has not been executed.")]
    NotExecuted,

    #[error("The query is running. Cancel it first.")]
    AlreadyRunning,
}

#[derive(Debug, Error, Clone)]
pub enum QueryError {
    #[error(transparent)]
    State(#[from] QueryStateError),

    #[error("Failed to load page: {0}")]
    Page(#[from] PageStoreError),
}

/// The page that is currently being read. Its tile is pinned in the cache.
#[derive(Debug, Clone, Copy)]
struct CurrentPage {
    key: TileKey,
    offset: usize,

    /// The whole node matches the filter, no need to test the points.
    accept_all: bool,
}

/// Cursor over the points of one or more datasets, that match a filter.
///
/// Points are returned in a fixed order: datasets in the order they were given, then nodes in the
/// depth first order of the spatial index, then points in page order.
///
/// The query does not own the pages it reads. They are borrowed from the [TileCache] passed into
/// [Query::next], which must be the same cache for the whole run. While a page is read, it is
/// pinned in the cache. [Query::cancel] releases the pin, so a query must not be dropped while
/// running without being cancelled.
pub struct Query {
    filter: QueryFilter,
    datasets: Vec<(DatasetId, Arc<SpatialIndexFile>)>,
    state: QueryState,
    dataset_pos: usize,
    traversal: NodeTraversal,
    current: Option<CurrentPage>,

    /// Leaf that was selected, but whose page could not be loaded yet.
    pending: Option<CurrentPage>,
    nr_points_returned: u64,
    nr_pages_read: u64,
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

impl Query {
    pub fn new() -> Self {
        Query {
            filter: QueryFilter::default(),
            datasets: Vec::new(),
            state: QueryState::New,
            dataset_pos: 0,
            traversal: NodeTraversal::new(),
            current: None,
            pending: None,
            nr_points_returned: 0,
            nr_pages_read: 0,
        }
    }

    /// A new query, that has not been executed yet.
    pub fn with_filter(filter: QueryFilter, datasets: Vec<(DatasetId, Arc<SpatialIndexFile>)>) -> Self {
        Query {
            filter,
            datasets,
            ..Self::new()
        }
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    pub fn datasets(&self) -> impl Iterator<Item = DatasetId> + '_ {
        self.datasets.iter().map(|(id, _)| *id)
    }

    pub fn nr_points_returned(&self) -> u64 {
        self.nr_points_returned
    }

    pub fn nr_pages_read(&self) -> u64 {
        self.nr_pages_read
    }

    pub fn set_filter(&mut self, filter: QueryFilter) -> Result<(), QueryStateError> {
        self.reset_to_new()?;
        self.filter = filter;
        Ok(())
    }

    pub fn set_datasets(
        &mut self,
        datasets: Vec<(DatasetId, Arc<SpatialIndexFile>)>,
    ) -> Result<(), QueryStateError> {
        self.reset_to_new()?;
        self.datasets = datasets;
        Ok(())
    }

    fn reset_to_new(&mut self) -> Result<(), QueryStateError> {
        if self.state == QueryState::Running {
            return Err(QueryStateError::AlreadyRunning);
        }
        self.state = QueryState::New;
        Ok(())
    }

    /// Starts iterating from the beginning.
    /// Can be called again after the query was exhausted or cancelled.
    pub fn exec(&mut self) -> Result<(), QueryStateError> {
        if self.state == QueryState::Running {
            return Err(QueryStateError::AlreadyRunning);
        }
        self.state = QueryState::Running;
        self.dataset_pos = 0;
        self.traversal = NodeTraversal::new();
        self.current = None;
        self.pending = None;
        self.nr_points_returned = 0;
        self.nr_pages_read = 0;
        debug!(
            "Executing query over {} datasets: {:?}",
            self.datasets.len(),
            self.filter
        );
        Ok(())
    }

    /// Returns the next matching point, or `None` once all points have been returned.
    ///
    /// If a page fails to load, the error is returned and the query stays at that page,
    /// so calling `next` again retries the same page.
    pub fn next<L>(&mut self, cache: &mut TileCache<L>) -> Result<Option<PointRecord>, QueryError>
    where
        L: PageLoader<Key = TileKey, Data = Page, Error = PageStoreError>,
    {
        let mut batch = self.read(cache, 1)?;
        Ok(batch.pop())
    }

    /// Returns up to `limit` matching points, all from the same page.
    /// An empty batch means, that the query is finished.
    pub fn next_batch<L>(
        &mut self,
        cache: &mut TileCache<L>,
        limit: usize,
    ) -> Result<Vec<PointRecord>, QueryError>
    where
        L: PageLoader<Key = TileKey, Data = Page, Error = PageStoreError>,
    {
        self.read(cache, limit.max(1))
    }

    fn read<L>(
        &mut self,
        cache: &mut TileCache<L>,
        limit: usize,
    ) -> Result<Vec<PointRecord>, QueryError>
    where
        L: PageLoader<Key = TileKey, Data = Page, Error = PageStoreError>,
    {
        let _span = span!("Query::next");
        match self.state {
            QueryState::New => return Err(QueryStateError::NotExecuted.into()),
            QueryState::Exhausted | QueryState::Cancelled => return Ok(Vec::new()),
            QueryState::Running => (),
        }

        let mut batch = Vec::new();
        loop {
            if !self.ensure_page(cache)? {
                self.state = QueryState::Exhausted;
                debug!(
                    "Query finished: {} points from {} pages.",
                    self.nr_points_returned, self.nr_pages_read
                );
                return Ok(batch);
            }
            let Some(current) = self.current.as_mut() else {
                continue;
            };
            if let Some(page) = cache.peek(&current.key) {
                while current.offset < page.len() && batch.len() < limit {
                    let point = page.point(current.offset);
                    current.offset += 1;
                    if current.accept_all || self.filter.matches(&point) {
                        batch.push(point);
                    }
                }
                if current.offset < page.len() || !batch.is_empty() {
                    self.nr_points_returned += batch.len() as u64;
                    return Ok(batch);
                }
            }

            // page done
            let key = current.key;
            self.current = None;
            cache.unpin(&key);
        }
    }

    /// Makes sure, that there is a current page with its tile pinned.
    /// Returns false, if there are no more pages.
    fn ensure_page<L>(&mut self, cache: &mut TileCache<L>) -> Result<bool, PageStoreError>
    where
        L: PageLoader<Key = TileKey, Data = Page, Error = PageStoreError>,
    {
        if let Some(current) = &self.current {
            if !cache.contains(&current.key) {
                // dropped from the cache by someone else, along with the pin
                cache.pin(&current.key)?;
            }
            return Ok(true);
        }
        if self.pending.is_none() {
            self.pending = self.next_leaf();
        }
        let Some(pending) = self.pending else {
            return Ok(false);
        };
        cache.pin(&pending.key)?;
        self.pending = None;
        self.current = Some(pending);
        self.nr_pages_read += 1;
        Ok(true)
    }

    /// Finds the next non-empty leaf matching the filter.
    fn next_leaf(&mut self) -> Option<CurrentPage> {
        while let Some((dataset, index)) = self.datasets.get(self.dataset_pos) {
            let filter = &self.filter;
            let leaf = self
                .traversal
                .next_leaf(index, |node| filter.intersects_box(&node.bounds));
            match leaf.and_then(|id| index.node(id)) {
                Some(node) => {
                    let nr_points = node.page_ref().map(|p| p.nr_points).unwrap_or(0);
                    if nr_points == 0 {
                        continue;
                    }
                    return Some(CurrentPage {
                        key: TileKey::new(*dataset, node.id),
                        offset: 0,
                        accept_all: filter.classify_node(&node.bounds) == NodeQueryResult::Positive,
                    });
                }
                None => {
                    self.dataset_pos += 1;
                    self.traversal = NodeTraversal::new();
                }
            }
        }
        None
    }

    /// Stops the query and releases its pin.
    /// Can be called any number of times, in any state.
    pub fn cancel<L>(&mut self, cache: &mut TileCache<L>)
    where
        L: PageLoader<Key = TileKey>,
    {
        if let Some(current) = self.current.take() {
            cache.unpin(&current.key);
        }
        self.pending = None;
        if self.state == QueryState::Running {
            debug!("Query cancelled after {} points.", self.nr_points_returned);
            self.state = QueryState::Cancelled;
        }
    }
}
