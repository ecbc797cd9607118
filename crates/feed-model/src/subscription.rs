//! Keyed observer registry.
//!
//! Every subscription gets a fresh id from a monotonic counter, so a handle
//! for a subscription that was removed never matches a later one registered
//! under the same key. Delivery snapshots the subscribers, releases the lock
//! and re-checks each one right before calling it: a handler unsubscribed
//! mid-delivery is skipped.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub struct Subscription<F: ?Sized> {
    pub id: SubscriptionId,
    pub handler: Arc<F>,
}

impl<F: ?Sized> Clone for Subscription<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: self.handler.clone(),
        }
    }
}

pub struct SubscriptionRegistry<K, F: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<FnvHashMap<K, Vec<Subscription<F>>>>,
}

impl<K, F: ?Sized> std::fmt::Debug for SubscriptionRegistry<K, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("keys", &self.entries.lock().len())
            .finish()
    }
}

impl<K: Eq + Hash + Clone, F: ?Sized> Default for SubscriptionRegistry<K, F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, F: ?Sized> SubscriptionRegistry<K, F> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn subscribe(&self, key: K, handler: Arc<F>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .entry(key)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Removes one subscription. Returns false for stale or unknown ids.
    pub fn unsubscribe<Q>(&self, key: &Q, id: SubscriptionId) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut entries = self.entries.lock();
        let Some(subscribers) = entries.get_mut(key) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|subscription| subscription.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            entries.remove(key);
        }
        removed
    }

    /// Drops every subscription under `key` and hands them back.
    pub fn remove_key<Q>(&self, key: &Q) -> Vec<Subscription<F>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().remove(key).unwrap_or_default()
    }

    pub fn subscribers<Q>(&self, key: &Q) -> Vec<Subscription<F>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn is_live<Q>(&self, key: &Q, id: SubscriptionId) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|subscribers| subscribers.iter().any(|s| s.id == id))
    }

    pub fn has_subscribers<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Total number of live subscriptions across all keys.
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Calls `deliver` for each subscriber of `key` that is still live.
    ///
    /// No lock is held while a handler runs, so handlers may subscribe or
    /// unsubscribe freely. Returns how many handlers were called.
    pub fn deliver<Q>(&self, key: &Q, deliver: impl FnMut(&F)) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.deliver_to(key, self.subscribers(key), deliver)
    }

    /// Like `deliver`, over a snapshot taken earlier with `subscribers`.
    /// Subscriptions added since the snapshot are not called.
    pub fn deliver_to<Q>(
        &self,
        key: &Q,
        snapshot: Vec<Subscription<F>>,
        mut deliver: impl FnMut(&F),
    ) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut delivered = 0;
        for subscription in snapshot {
            if !self.is_live(key, subscription.id) {
                continue;
            }
            deliver(subscription.handler.as_ref());
            delivered += 1;
        }
        delivered
    }
}
