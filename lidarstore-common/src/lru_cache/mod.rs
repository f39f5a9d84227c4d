pub mod lru;
pub mod tile_cache;

/// Responsible for loading pages to/from disk.
pub trait PageLoader {
    type Key;
    type Data: CachedPage;
    type Error;

    fn load(&self, key: &Self::Key) -> Result<Self::Data, Self::Error>;
    fn store(&self, key: &Self::Key, data: &Self::Data) -> Result<(), Self::Error>;

    /// Tests, if a page can be loaded for the given key.
    fn exists(&self, key: &Self::Key) -> bool;
}

/// Data that is held by the tile cache.
pub trait CachedPage {
    /// True, if the data was changed since it was loaded or last stored.
    fn is_dirty(&self) -> bool;

    /// Called after the data was stored.
    fn mark_clean(&mut self);
}
