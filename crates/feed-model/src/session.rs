//! Session context: owns one feed model and its offline tracker.
//!
//! Hosts build one `FeedSession` per feed session and pass it where the
//! model or the tracker is needed. There is no process-wide state.

use std::sync::{Arc, Weak};

use crate::config::FeedConfig;
use crate::dispatch::TaskRunner;
use crate::model::{FeedModel, FeedObserver};
use crate::mutation::MutationBuilder;
use crate::offline::{OfflineAvailabilityTracker, OfflineStatusHost};

/// Sends queued offline lookups once new content has been committed.
struct OfflineRefresh {
    tracker: Weak<OfflineAvailabilityTracker>,
}

impl FeedObserver for OfflineRefresh {
    fn on_new_content_received(&self, _is_refresh: bool, _timestamp_ms: i64) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.request_offline_status_for_new_content();
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedSession {
    model: Arc<FeedModel>,
    offline: Arc<OfflineAvailabilityTracker>,
}

impl FeedSession {
    pub fn new(
        config: FeedConfig,
        runner: Arc<dyn TaskRunner>,
        offline_host: Arc<dyn OfflineStatusHost>,
    ) -> Self {
        let model = Arc::new(FeedModel::new(config, runner.clone()));
        let offline = Arc::new(OfflineAvailabilityTracker::new(offline_host, runner));
        model.register_observer(Arc::new(OfflineRefresh {
            tracker: Arc::downgrade(&offline),
        }));
        log::debug!("feed session created");
        Self { model, offline }
    }

    pub fn model(&self) -> &Arc<FeedModel> {
        &self.model
    }

    pub fn offline(&self) -> &Arc<OfflineAvailabilityTracker> {
        &self.offline
    }

    pub fn edit(&self) -> MutationBuilder {
        self.model.edit()
    }

    /// Invalidates the model and drops pending offline lookups in one step.
    pub fn invalidate(&self) -> bool {
        let offline = self.offline.clone();
        self.model
            .invalidate_with(move || offline.clear_pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InlineRunner;
    use crate::error::{FeedError, HostError};
    use crate::model::ModelState;
    use crate::types::Payload;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct OfflineIndex {
        queries: Mutex<Vec<Vec<String>>>,
    }

    impl OfflineStatusHost for OfflineIndex {
        fn query_offline_status(&self, urls: Vec<String>) -> Result<Vec<String>, HostError> {
            self.queries.lock().push(urls.clone());
            Ok(urls)
        }
    }

    fn session(host: Arc<OfflineIndex>) -> FeedSession {
        FeedSession::new(FeedConfig::default(), Arc::new(InlineRunner), host)
    }

    #[test]
    fn new_content_flushes_offline_lookups() {
        let host = Arc::new(OfflineIndex::default());
        let session = session(host.clone());
        assert!(!session.offline().is_available_offline("https://a"));

        session
            .edit()
            .add_child(
                "root",
                None,
                Payload::feature_with_url("https://a", b"a".to_vec()),
            )
            .commit()
            .unwrap();

        assert_eq!(*host.queries.lock(), vec![vec!["https://a".to_string()]]);
        assert!(session.offline().is_available_offline("https://a"));
    }

    #[test]
    fn invalidate_clears_model_and_pending_lookups() {
        let session = session(Arc::new(OfflineIndex::default()));
        session
            .edit()
            .add_child("root", None, Payload::feature(b"root".to_vec()))
            .commit()
            .unwrap();
        session.offline().is_available_offline("https://late");
        assert_eq!(session.offline().pending_count(), 1);

        assert!(session.invalidate());
        assert_eq!(session.model().state(), ModelState::Invalidated);
        assert_eq!(session.offline().pending_count(), 0);
        assert!(!session.invalidate());

        let error = session
            .edit()
            .add_child("again", None, Payload::feature(b"x".to_vec()))
            .commit()
            .unwrap_err();
        assert!(matches!(error, FeedError::Invalidated));
    }
}
