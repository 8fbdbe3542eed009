//! Map wrapper that never creates entries on lookup.
//!
//! Router, tunnel and pending-resolution tables are all keyed maps where an
//! accidental insert on read (the `table[key].field = ...` pattern) would
//! silently create a half-initialised entry. `SyncMap` exposes only explicit
//! insertion, and hands out owned clones for reads that must outlive a lock.

use std::collections::HashMap;
use std::hash::Hash;

/// A map wrapper that prevents auto-vivification.
///
/// # Example
///
/// ```
/// use hostagent_common::SyncMap;
///
/// let mut map: SyncMap<String, u32> = SyncMap::new();
/// assert!(map.get(&"missing".to_string()).is_none());
/// assert!(map.is_empty());
///
/// map.insert("r1".to_string(), 7);
/// assert_eq!(map.get_cloned(&"r1".to_string()), Some(7));
/// ```
#[derive(Debug, Clone)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns a reference to the value. **Never creates entries.**
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Returns a mutable reference to the value. **Never creates entries.**
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    /// Inserts a key-value pair, returning the previous value if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.inner.values_mut()
    }

    /// Returns the first entry matching `pred`.
    pub fn find<F>(&self, mut pred: F) -> Option<(&K, &V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.inner.iter().find(|(k, v)| pred(k, v))
    }

    /// Removes and returns every entry for which `pred` is true.
    pub fn drain_where<F>(&mut self, mut pred: F) -> Vec<(K, V)>
    where
        K: Clone,
        F: FnMut(&K, &V) -> bool,
    {
        let doomed: Vec<K> = self
            .inner
            .iter()
            .filter(|(k, v)| pred(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|k| self.inner.remove_entry(&k))
            .collect()
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Returns an owned copy of the value, safe to keep after the
    /// surrounding lock is released.
    pub fn get_cloned(&self, key: &K) -> Option<V> {
        self.inner.get(key).cloned()
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FromIterator<(K, V)> for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}
