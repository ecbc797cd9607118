//! Per-commit accumulation of removed content.

use std::sync::Arc;

use crate::types::{ModelChild, MutationContext};

/// Sees every node a commit detaches, then reports once.
pub trait RemoveTracking: Send {
    fn filter(&mut self, removed: &ModelChild);

    /// Hands the accumulated results to the consumer. Consumes the tracker,
    /// so a tracker can only ever report once.
    fn trigger_consumer_update(self: Box<Self>);
}

/// Builds a tracker for a commit, or `None` when the commit is not tracked.
pub type RemoveTrackingFactory =
    Arc<dyn Fn(&MutationContext) -> Option<Box<dyn RemoveTracking>> + Send + Sync>;

type Transform<T> = Box<dyn Fn(&ModelChild) -> Option<T> + Send>;
type Consumer<T> = Box<dyn FnOnce(Vec<T>) + Send>;

pub struct RemovalTracker<T> {
    transform: Transform<T>,
    consumer: Consumer<T>,
    matches: Vec<T>,
}

impl<T> std::fmt::Debug for RemovalTracker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalTracker")
            .field("matches", &self.matches.len())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> RemovalTracker<T> {
    /// `transform` maps a removed node to a result; `None` skips the node.
    pub fn new(
        transform: impl Fn(&ModelChild) -> Option<T> + Send + 'static,
        consumer: impl FnOnce(Vec<T>) + Send + 'static,
    ) -> Self {
        Self {
            transform: Box::new(transform),
            consumer: Box::new(consumer),
            matches: Vec::new(),
        }
    }

    pub fn matched(&self) -> &[T] {
        &self.matches
    }
}

impl<T: Send + 'static> RemoveTracking for RemovalTracker<T> {
    fn filter(&mut self, removed: &ModelChild) {
        match (self.transform)(removed) {
            Some(result) => self.matches.push(result),
            None => log::trace!("removal not tracked content_id={}", removed.content_id),
        }
    }

    fn trigger_consumer_update(self: Box<Self>) {
        let RemovalTracker {
            consumer, matches, ..
        } = *self;
        log::debug!("removal tracker reporting count={}", matches.len());
        consumer(matches);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeKind, Payload};
    use parking_lot::Mutex;

    fn removed(id: &str) -> ModelChild {
        ModelChild {
            content_id: id.into(),
            parent_id: Some("root".into()),
            kind: NodeKind::Feature,
            payload: Arc::new(Payload::feature(id.as_bytes().to_vec())),
            is_synthetic: false,
        }
    }

    #[test]
    fn identity_transform_reports_removed_ids_once() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let mut tracker: Box<dyn RemoveTracking> = Box::new(RemovalTracker::new(
            |child: &ModelChild| Some(child.content_id.to_string()),
            move |ids: Vec<String>| sink.lock().push(ids),
        ));

        tracker.filter(&removed("b"));
        tracker.trigger_consumer_update();

        assert_eq!(*reports.lock(), vec![vec!["b".to_string()]]);
    }

    #[test]
    fn unmatched_nodes_are_skipped() {
        let mut tracker = RemovalTracker::new(
            |child: &ModelChild| child.content_id.as_str().starts_with('k').then_some(1u32),
            |_: Vec<u32>| {},
        );
        tracker.filter(&removed("keep"));
        tracker.filter(&removed("drop"));
        assert_eq!(tracker.matched(), &[1]);
    }

    #[test]
    fn empty_commit_still_reports() {
        let reports = Arc::new(Mutex::new(None));
        let sink = reports.clone();
        let tracker: Box<dyn RemoveTracking> = Box::new(RemovalTracker::new(
            |_: &ModelChild| Some(()),
            move |results: Vec<()>| *sink.lock() = Some(results.len()),
        ));
        tracker.trigger_consumer_update();
        assert_eq!(*reports.lock(), Some(0));
    }
}
