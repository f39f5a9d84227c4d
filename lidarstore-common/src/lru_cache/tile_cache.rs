use super::lru::Lru;
use super::{CachedPage, PageLoader};
use crate::index::{DatasetId, TileKey};
use log::{debug, warn};
use std::fmt::Debug;
use std::hash::Hash;

struct CacheEntry<D> {
    data: D,
    pins: u32,
}

/// Keeps recently used pages in memory.
///
/// The number of cached pages is bounded by the capacity. Pinned pages are never evicted, so if
/// more pages than that are pinned, the cache grows beyond its capacity until they are unpinned.
/// Dirty pages are written back through the loader before they leave the cache.
///
/// The cache does no locking of its own. Callers serialize access (in the editor, by holding the
/// editor lock).
pub struct TileCache<L: PageLoader> {
    loader: L,
    entries: Lru<L::Key, CacheEntry<L::Data>>,
    capacity: usize,
}

impl<L> TileCache<L>
where
    L: PageLoader,
    L::Key: Hash + Eq + Clone + Debug,
{
    pub fn new(loader: L, capacity: usize) -> Self {
        TileCache {
            loader,
            entries: Lru::new(),
            capacity,
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Mutable access to the loader.
    /// Note that this does not invalidate anything: Cached pages stay cached, even if the loader
    /// would now produce different data for them.
    pub fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the capacity. If the cache holds more pages than the new capacity allows,
    /// unpinned pages are evicted right away.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), L::Error> {
        self.capacity = capacity;
        self.shrink()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of pages, that are currently pinned.
    pub fn pinned_count(&self) -> usize {
        self.entries.iter().filter(|(_, e)| e.pins > 0).count()
    }

    pub fn is_pinned(&self, key: &L::Key) -> bool {
        self.entries.get(key).is_some_and(|e| e.pins > 0)
    }

    pub fn contains(&self, key: &L::Key) -> bool {
        self.entries.contains_key(key)
    }

    /// The cached keys, least recently used first.
    pub fn keys(&self) -> impl Iterator<Item = &L::Key> {
        self.entries.keys()
    }

    /// Returns the page for the given key, loading it if it is not cached.
    /// The page becomes the most recently used one.
    pub fn get(&mut self, key: &L::Key) -> Result<&L::Data, L::Error> {
        let entry = self.fetch(key)?;
        Ok(&entry.data)
    }

    /// Like [TileCache::get], but for modifying the page.
    /// Pages changed through the returned reference must be marked dirty, in order to be written back.
    pub fn get_mut(&mut self, key: &L::Key) -> Result<&mut L::Data, L::Error> {
        let entry = self.fetch(key)?;
        Ok(&mut entry.data)
    }

    /// Returns the page, if it is cached. Does not change the LRU order and never loads.
    pub fn peek(&self, key: &L::Key) -> Option<&L::Data> {
        self.entries.get(key).map(|e| &e.data)
    }

    /// Loads the page (if needed) and protects it from eviction until the matching call to [TileCache::unpin].
    /// Pins are counted, so a page pinned twice needs to be unpinned twice.
    pub fn pin(&mut self, key: &L::Key) -> Result<&L::Data, L::Error> {
        let entry = self.fetch(key)?;
        entry.pins += 1;
        Ok(&entry.data)
    }

    /// Releases one pin. Returns false if the page was not pinned.
    /// Does not evict anything: The page stays cached until it is pushed out by other pages.
    pub fn unpin(&mut self, key: &L::Key) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.pins > 0 => {
                entry.pins -= 1;
                true
            }
            _ => {
                warn!("Unpinning {key:?}, which is not pinned.");
                false
            }
        }
    }

    fn fetch(&mut self, key: &L::Key) -> Result<&mut CacheEntry<L::Data>, L::Error> {
        // make room for the page, before it is loaded
        let target = if self.entries.contains_key(key) {
            self.capacity
        } else {
            self.capacity.saturating_sub(1)
        };
        self.evict_down_to(target, Some(key))?;

        let loader = &self.loader;
        self.entries.get_or_try_insert_with(key.clone(), || {
            debug!("Cache miss: {key:?}");
            loader.load(key).map(|data| CacheEntry { data, pins: 0 })
        })
    }

    /// Evicts unpinned pages in LRU order, until at most `target` pages are left
    /// (or all remaining pages are pinned).
    fn evict_down_to(&mut self, target: usize, protect: Option<&L::Key>) -> Result<(), L::Error> {
        let excess = self.entries.len().saturating_sub(target);
        if excess == 0 {
            return Ok(());
        }
        let victims = self
            .entries
            .iter()
            .filter(|(k, e)| e.pins == 0 && Some(*k) != protect)
            .map(|(k, _)| k.clone())
            .take(excess)
            .collect::<Vec<_>>();
        for key in victims {
            self.write_back(&key)?;
            self.entries.remove(&key);
        }
        Ok(())
    }

    fn write_back(&mut self, key: &L::Key) -> Result<(), L::Error> {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.data.is_dirty() {
                self.loader.store(key, &entry.data)?;
                entry.data.mark_clean();
            }
        }
        Ok(())
    }

    /// Evicts unpinned pages until the cache is within its capacity.
    pub fn shrink(&mut self) -> Result<(), L::Error> {
        self.evict_down_to(self.capacity, None)
    }

    /// Writes all dirty pages back. Returns the number of written pages.
    pub fn flush(&mut self) -> Result<usize, L::Error> {
        let dirty = self
            .entries
            .iter()
            .filter(|(_, e)| e.data.is_dirty())
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        for key in &dirty {
            self.write_back(key)?;
        }
        Ok(dirty.len())
    }

    /// Drops all pages whose key matches the predicate, writing back the dirty ones first.
    ///
    /// Pages are dropped even if they are pinned. If writing back a page fails, that page stays in the
    /// cache (so its changes are not lost) and the first error is returned after all other
    /// pages have been processed.
    pub fn invalidate_matching(
        &mut self,
        mut predicate: impl FnMut(&L::Key) -> bool,
    ) -> Result<(), L::Error> {
        let keys = self
            .entries
            .keys()
            .filter(|k| predicate(k))
            .cloned()
            .collect::<Vec<_>>();
        let mut result = Ok(());
        for key in keys {
            if self.is_pinned(&key) {
                warn!("Invalidating {key:?}, which is still pinned.");
            }
            match self.write_back(&key) {
                Ok(()) => {
                    self.entries.remove(&key);
                }
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    /// Drops all pages, writing back the dirty ones first.
    pub fn clear(&mut self) -> Result<(), L::Error> {
        self.invalidate_matching(|_| true)
    }
}

impl<L> TileCache<L>
where
    L: PageLoader<Key = TileKey>,
{
    /// Drops all pages of the dataset, writing back the dirty ones first.
    pub fn invalidate(&mut self, dataset: DatasetId) -> Result<(), L::Error> {
        self.invalidate_matching(|key| key.dataset == dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq)]
    struct TestPage {
        value: u32,
        dirty: bool,
    }

    impl CachedPage for TestPage {
        fn is_dirty(&self) -> bool {
            self.dirty
        }

        fn mark_clean(&mut self) {
            self.dirty = false;
        }
    }

    #[derive(Debug, PartialEq)]
    struct TestError(u32);

    /// Pages are numbered, page `n` initially holds the value `n`.
    /// Page numbers >= 1000 fail to load.
    #[derive(Default)]
    struct TestLoader {
        stored: RefCell<HashMap<u32, u32>>,
        loads: Cell<usize>,
        fail_store: Cell<bool>,
    }

    impl PageLoader for TestLoader {
        type Key = u32;
        type Data = TestPage;
        type Error = TestError;

        fn load(&self, key: &u32) -> Result<TestPage, TestError> {
            if *key >= 1000 {
                return Err(TestError(*key));
            }
            self.loads.set(self.loads.get() + 1);
            let value = self.stored.borrow().get(key).copied().unwrap_or(*key);
            Ok(TestPage {
                value,
                dirty: false,
            })
        }

        fn store(&self, key: &u32, data: &TestPage) -> Result<(), TestError> {
            if self.fail_store.get() {
                return Err(TestError(*key));
            }
            self.stored.borrow_mut().insert(*key, data.value);
            Ok(())
        }

        fn exists(&self, key: &u32) -> bool {
            *key < 1000
        }
    }

    fn cache(capacity: usize) -> TileCache<TestLoader> {
        TileCache::new(TestLoader::default(), capacity)
    }

    #[test]
    fn hit_and_miss() {
        let mut cache = cache(4);
        assert_eq!(cache.get(&1).unwrap().value, 1);
        assert_eq!(cache.get(&2).unwrap().value, 2);
        assert_eq!(cache.get(&1).unwrap().value, 1);
        assert_eq!(cache.loader().loads.get(), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&3).is_none());
        assert!(cache.loader().exists(&3));
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = cache(3);
        for key in [1, 2, 3] {
            cache.get(&key).unwrap();
        }
        cache.get(&1).unwrap();
        cache.get(&4).unwrap();
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec![3, 1, 4]);

        // peek does not count as a use
        cache.peek(&3);
        cache.get(&5).unwrap();
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec![1, 4, 5]);
    }

    #[test]
    fn pinned_pages_are_not_evicted() {
        let mut cache = cache(2);
        cache.pin(&1).unwrap();
        cache.pin(&2).unwrap();
        cache.pin(&3).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.pinned_count(), 3);
        assert!(cache.len() <= cache.capacity().max(cache.pinned_count()));

        cache.pin(&3).unwrap();
        assert!(cache.unpin(&3));
        assert!(cache.is_pinned(&3));
        assert!(cache.unpin(&3));
        assert!(!cache.unpin(&3));

        // unpinning does not evict
        assert!(cache.unpin(&1));
        assert!(cache.unpin(&2));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.pinned_count(), 0);

        // the next access does
        cache.get(&4).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&4));
    }

    #[test]
    fn page_above_capacity_is_evicted_first() {
        let mut cache = cache(2);
        cache.pin(&1).unwrap();
        cache.pin(&2).unwrap();
        cache.get(&3).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.pinned_count(), 2);

        cache.shrink().unwrap();
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&3));

        // without an explicit shrink, the next access pushes it out
        cache.get(&3).unwrap();
        cache.get(&4).unwrap();
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&3));
        assert!(cache.contains(&4));
    }

    #[test]
    fn size_bound_under_random_access() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(5);
        let mut cache = cache(8);
        let mut pinned = Vec::new();
        for _ in 0..2000 {
            let key = rng.gen_range(0..40);
            match rng.gen_range(0..4) {
                0 => {
                    cache.pin(&key).unwrap();
                    pinned.push(key);
                    assert!(cache.len() <= cache.capacity().max(cache.pinned_count() + 1));
                }
                1 if !pinned.is_empty() => {
                    let i = rng.gen_range(0..pinned.len());
                    assert!(cache.unpin(&pinned.swap_remove(i)));
                }
                2 => {
                    cache.get(&key).unwrap();
                    cache.shrink().unwrap();
                    assert!(cache.len() <= cache.capacity().max(cache.pinned_count()));
                }
                _ => {
                    cache.get(&key).unwrap();
                    // the page just returned may be the only unpinned one
                    assert!(cache.len() <= cache.capacity().max(cache.pinned_count() + 1));
                }
            }
        }
        for key in pinned.drain(..) {
            cache.unpin(&key);
        }
        assert_eq!(cache.pinned_count(), 0);
        cache.get(&0).unwrap();
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn dirty_pages_are_written_on_eviction() {
        let mut cache = cache(1);
        let page = cache.get_mut(&7).unwrap();
        page.value = 70;
        page.dirty = true;
        cache.get(&8).unwrap();
        assert!(!cache.contains(&7));
        assert_eq!(cache.loader().stored.borrow().get(&7), Some(&70));
        assert_eq!(cache.get(&7).unwrap().value, 70);
    }

    #[test]
    fn failed_write_back_keeps_the_page() {
        let mut cache = cache(1);
        cache.get_mut(&7).unwrap().dirty = true;
        cache.loader().fail_store.set(true);
        assert_eq!(cache.get(&8).err(), Some(TestError(7)));
        assert!(cache.contains(&7));
        assert!(cache.peek(&7).unwrap().is_dirty());

        cache.loader().fail_store.set(false);
        assert_eq!(cache.flush().unwrap(), 1);
        assert!(!cache.peek(&7).unwrap().is_dirty());
        assert_eq!(cache.flush().unwrap(), 0);
    }

    #[test]
    fn failed_load_inserts_nothing() {
        let mut cache = cache(2);
        cache.get(&1).unwrap();
        assert_eq!(cache.get(&1001).err(), Some(TestError(1001)));
        assert_eq!(cache.pin(&1002).err(), Some(TestError(1002)));
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(cache.pinned_count(), 0);
    }

    #[test]
    fn invalidate_writes_back() {
        let mut cache = cache(10);
        for key in 0..6 {
            cache.get_mut(&key).unwrap().dirty = key % 2 == 0;
        }
        cache.invalidate_matching(|k| *k < 3).unwrap();
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        let stored = cache.loader().stored.borrow().clone();
        assert_eq!(stored.len(), 2);
        assert!(stored.contains_key(&0) && stored.contains_key(&2));
    }

    #[test]
    fn set_capacity_shrinks() {
        let mut cache = cache(10);
        for key in 0..10 {
            cache.get(&key).unwrap();
        }
        cache.pin(&0).unwrap();
        cache.set_capacity(3).unwrap();
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&0));
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec![8, 9, 0]);
    }
}
