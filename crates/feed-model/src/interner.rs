//! Value interning pools for node payloads.
//!
//! Paginated fetches tend to resend the same blobs (images, semantic
//! properties, shared state). `Interner` keeps one canonical `Arc` per
//! distinct value so duplicates share storage, and `InternedMap` is a map
//! whose values pass through an interner on `put`.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::Mutex;

/// A pool that stores each distinct value exactly once.
///
/// Equality is structural: two separately built values that compare equal
/// intern to the same `Arc`. Entries stay alive until `clear()`.
pub struct Interner<T> {
    inner: Mutex<FnvHashSet<Arc<T>>>,
}

impl<T> std::fmt::Debug for Interner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interner")
            .field("len", &self.inner.lock().len())
            .finish()
    }
}

impl<T: Eq + Hash> Default for Interner<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash> Interner<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FnvHashSet::default()),
        }
    }

    /// Returns the pooled instance equal to `value`, pooling `value` if none exists.
    pub fn intern(&self, value: T) -> Arc<T> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(&value) {
            return existing.clone();
        }
        let value = Arc::new(value);
        inner.insert(value.clone());
        value
    }

    /// Same as `intern`, for values that are already shared.
    pub fn intern_arc(&self, value: Arc<T>) -> Arc<T> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(value.as_ref()) {
            return existing.clone();
        }
        inner.insert(value.clone());
        value
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Map whose values are interned on `put`. Reads never touch the pool.
pub struct InternedMap<K, V> {
    interner: Arc<Interner<V>>,
    map: Mutex<FnvHashMap<K, Arc<V>>>,
}

impl<K, V> std::fmt::Debug for InternedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternedMap")
            .field("len", &self.map.lock().len())
            .finish()
    }
}

impl<K: Eq + Hash, V: Eq + Hash> InternedMap<K, V> {
    pub fn new(interner: Arc<Interner<V>>) -> Self {
        Self {
            interner,
            map: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Stores the interned form of `value`, returning the previous value.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        let value = self.interner.intern(value);
        self.map.lock().insert(key, value)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.lock().get(key).cloned()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.lock().contains_key(key)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the map. The shared pool is left alone.
    pub fn clear(&self) {
        self.map.lock().clear();
    }
}
