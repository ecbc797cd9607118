//! Offline availability cache for article urls.
//!
//! Lookups never block on the host: an unknown url answers `false` and is
//! queued. `request_offline_status_for_new_content` later sends the whole
//! queue in one host query, outside the state lock, and merges the answer.

use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::Mutex;

use crate::dispatch::TaskRunner;
use crate::error::HostError;
use crate::subscription::{SubscriptionId, SubscriptionRegistry};

/// Host side of the offline index.
pub trait OfflineStatusHost: Send + Sync {
    /// Returns the subset of `urls` that is available offline.
    fn query_offline_status(&self, urls: Vec<String>) -> Result<Vec<String>, HostError>;
}

pub trait OfflineStatusObserver: Send + Sync {
    fn on_offline_status_changed(&self, url: &str, available: bool);
}

#[derive(Debug, Default)]
struct OfflineState {
    cache: FnvHashMap<String, bool>,
    pending: FnvHashSet<String>,
}

pub struct OfflineAvailabilityTracker {
    host: Arc<dyn OfflineStatusHost>,
    runner: Arc<dyn TaskRunner>,
    state: Mutex<OfflineState>,
    observers: Arc<SubscriptionRegistry<String, dyn OfflineStatusObserver>>,
}

impl std::fmt::Debug for OfflineAvailabilityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OfflineAvailabilityTracker")
            .field("cached", &state.cache.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl OfflineAvailabilityTracker {
    pub fn new(host: Arc<dyn OfflineStatusHost>, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            host,
            runner,
            state: Mutex::new(OfflineState::default()),
            observers: Arc::new(SubscriptionRegistry::new()),
        }
    }

    /// Cached availability of `url`. Unknown urls are queued and read as `false`.
    pub fn is_available_offline(&self, url: &str) -> bool {
        let mut state = self.state.lock();
        match state.cache.get(url) {
            Some(available) => *available,
            None => {
                state.pending.insert(url.to_string());
                false
            }
        }
    }

    /// Sends every queued url to the host in one query and merges the answer.
    ///
    /// Returns how many urls were queried. On host failure the urls go back
    /// to the queue for the next call.
    pub fn request_offline_status_for_new_content(&self) -> usize {
        let urls: Vec<String> = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return 0;
            }
            state.pending.drain().collect()
        };
        let requested = urls.len();

        match self.host.query_offline_status(urls.clone()) {
            Ok(available) => {
                let available: FnvHashSet<String> = available.into_iter().collect();
                for url in urls {
                    let is_available = available.contains(&url);
                    self.update_offline_status(&url, is_available);
                }
                log::debug!(
                    "offline status merged requested={} available={}",
                    requested,
                    available.len()
                );
            }
            Err(error) => {
                log::warn!(
                    "offline status query failed requested={} error={}",
                    requested,
                    error
                );
                let mut state = self.state.lock();
                for url in urls {
                    if !state.cache.contains_key(&url) {
                        state.pending.insert(url);
                    }
                }
            }
        }
        requested
    }

    pub fn add_offline_status_consumer(
        &self,
        url: &str,
        observer: Arc<dyn OfflineStatusObserver>,
    ) -> SubscriptionId {
        self.observers.subscribe(url.to_string(), observer)
    }

    pub fn remove_offline_status_consumer(&self, url: &str, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(url, id)
    }

    /// Records a new status for `url`. Returns false when nothing changed.
    pub fn update_offline_status(&self, url: &str, available: bool) -> bool {
        {
            let mut state = self.state.lock();
            state.pending.remove(url);
            if state.cache.get(url) == Some(&available) {
                return false;
            }
            state.cache.insert(url.to_string(), available);
        }

        let observers = self.observers.clone();
        let url = url.to_string();
        self.runner.execute(
            "offline_status_changed",
            Box::new(move || {
                observers.deliver(url.as_str(), |observer| {
                    observer.on_offline_status_changed(&url, available)
                });
            }),
        );
        true
    }

    /// Drops queued lookups, e.g. when the session is invalidated.
    pub fn clear_pending(&self) {
        let mut state = self.state.lock();
        if !state.pending.is_empty() {
            log::debug!("offline pending requests dropped count={}", state.pending.len());
        }
        state.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn cached_count(&self) -> usize {
        self.state.lock().cache.len()
    }
}
