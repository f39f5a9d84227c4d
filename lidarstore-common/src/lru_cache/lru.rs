use std::collections::{hash_map, BTreeMap, HashMap};
use std::hash::Hash;

/// A map with last recently used ordering.
///
/// Every access through [Lru::get_or_try_insert_with] stamps the entry with the value of a monotonic access counter.
/// The LRU order is the order of these stamps.
pub struct Lru<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<u64, K>,
    clock: u64,
}

struct Entry<V> {
    data: V,
    last_access: u64,
}

impl<K, V> Default for Lru<K, V> {
    fn default() -> Self {
        Lru {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }
}

impl<K, V> Lru<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored elements
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Lru<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Moves the entry with the given key to the end of the LRU order.
    /// If there is no such entry, it is created by calling `make`. If `make` fails, the Lru
    /// is left unchanged.
    pub fn get_or_try_insert_with<E>(
        &mut self,
        key: K,
        make: impl FnOnce() -> Result<V, E>,
    ) -> Result<&mut V, E> {
        let now = self.clock + 1;
        let entry = match self.entries.entry(key.clone()) {
            hash_map::Entry::Occupied(o) => {
                let entry = o.into_mut();
                self.order.remove(&entry.last_access);
                entry.last_access = now;
                entry
            }
            hash_map::Entry::Vacant(v) => v.insert(Entry {
                data: make()?,
                last_access: now,
            }),
        };
        self.clock = now;
        self.order.insert(now, key);
        Ok(&mut entry.data)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns a reference to the value stored under the given key, if it exists.
    /// This will NOT change the item's position in the LRU order.
    /// Use [Lru::get_or_try_insert_with], if you want to also move it to the end of the LRU order.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.data)
    }

    /// Like [Lru::get], but returns a mutable reference. The LRU order is not changed.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|e| &mut e.data)
    }

    /// Removes the entry with the given key and returns the value, that it stored.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.last_access);
        Some(entry.data)
    }

    /// Returns an iterator over all entries.
    /// The entries are visited in the lru order,
    /// so entries that have recently been accessed will come last.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order.values().filter_map(|k| {
            let (k, entry) = self.entries.get_key_value(k)?;
            Some((k, &entry.data))
        })
    }

    /// Returns the keys in lru order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access<K: Hash + Eq + Clone, V>(lru: &mut Lru<K, V>, key: K, value: V) -> &mut V {
        lru.get_or_try_insert_with(key, || Ok::<_, ()>(value)).unwrap()
    }

    #[test]
    fn test_iter() {
        let mut lru = Lru::new();
        access(&mut lru, 3, 1);
        access(&mut lru, 1, 2);
        access(&mut lru, 2, 3);
        access(&mut lru, 1, 0);
        let items = lru.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
        assert_eq!(items, vec![(3, 1), (2, 3), (1, 2),]);
    }

    #[test]
    fn test_remove() {
        let mut lru = Lru::new();
        access(&mut lru, 1, 1);
        access(&mut lru, 2, 2);
        access(&mut lru, 3, 3);
        assert_eq!(lru.remove(&2), Some(2));
        assert_eq!(lru.remove(&2), None);
        let items = lru.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
        assert_eq!(items, vec![(1, 1), (3, 3),]);
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_reaccess_keeps_value() {
        let mut lru = Lru::new();
        access(&mut lru, "a", 1);
        access(&mut lru, "b", 2);
        assert_eq!(*access(&mut lru, "a", 10), 1);
        assert_eq!(lru.keys().copied().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(lru.get(&"a"), Some(&1));
    }

    #[test]
    fn test_get_does_not_touch() {
        let mut lru = Lru::new();
        access(&mut lru, 1, 1);
        access(&mut lru, 2, 2);
        *lru.get_mut(&1).unwrap() += 5;
        assert_eq!(lru.get(&1), Some(&6));
        assert_eq!(lru.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert!(lru.get_mut(&3).is_none());
        assert!(!lru.contains_key(&3));
    }

    #[test]
    fn test_get_or_try_insert_with() {
        let mut lru = Lru::new();
        access(&mut lru, 1, 1);
        access(&mut lru, 2, 2);
        let v = lru.get_or_try_insert_with(1, || Err::<i32, ()>(())).unwrap();
        assert_eq!(*v, 1);
        assert_eq!(lru.keys().copied().collect::<Vec<_>>(), vec![2, 1]);

        assert_eq!(lru.get_or_try_insert_with(3, || Err("fail")), Err("fail"));
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.keys().copied().collect::<Vec<_>>(), vec![2, 1]);

        *lru.get_or_try_insert_with(3, || Ok::<_, ()>(30)).unwrap() += 1;
        assert_eq!(
            lru.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
            vec![(2, 2), (1, 1), (3, 31)]
        );
    }

    #[test]
    fn test_order_after_removals() {
        let mut lru = Lru::new();
        for i in 0..6 {
            access(&mut lru, i, i * 10);
        }
        access(&mut lru, 0, 0);
        for i in [1, 3, 5] {
            lru.remove(&i);
        }
        assert_eq!(lru.keys().copied().collect::<Vec<_>>(), vec![2, 4, 0]);
        assert_eq!(lru.len(), 3);
        assert!(!lru.is_empty());
    }
}
