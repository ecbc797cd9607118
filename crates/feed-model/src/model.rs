//! The feed model: session lifecycle, commit path and token handling.
//!
//! ## Commit path
//!
//! A commit runs under the commit lock, in this order:
//!
//! 1. lifecycle and session checks,
//! 2. the filter predicate,
//! 3. `ContentTreeStore::apply` (all-or-nothing),
//! 4. token registration and discard,
//! 5. removal tracking,
//! 6. synthetic paging of the first root's children.
//!
//! Observer notifications are collected while the lock is held and handed
//! to the `TaskRunner` only after it is released, so an observer may call
//! back into the model.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::FeedConfig;
use crate::cursor::Cursor;
use crate::dispatch::{Task, TaskRunner};
use crate::error::{FeedError, ModelError, ModelErrorKind, Result};
use crate::mutation::{Change, CommitOutcome, CommitSummary, Committer, MutationBuilder};
use crate::paging::{self, PageWindow};
use crate::removal::RemoveTrackingFactory;
use crate::store::{ContentTreeStore, Staging};
use crate::subscription::{Subscription, SubscriptionId, SubscriptionRegistry};
use crate::tokens::{TokenCompleted, TokenCompletedObserver, TokenEntry, TokenRegistry};
use crate::types::{
    ContentId, ModelChild, MutationContext, Node, OpKind, Payload, StreamToken, StructureOp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Initializing,
    Ready,
    Invalidated,
}

/// Session-level notifications.
pub trait FeedObserver: Send + Sync {
    fn on_session_start(&self) {}

    fn on_session_finished(&self) {}

    fn on_error(&self, _error: &ModelError) {}

    /// `is_refresh` is false when the content came from a continuation token.
    fn on_new_content_received(&self, _is_refresh: bool, _timestamp_ms: i64) {}
}

/// Host side of network pagination.
pub trait TokenHandler: Send + Sync {
    fn handle_token(&self, session_id: &str, token: &StreamToken);
}

/// Drops structure ops before they reach the store when it returns false.
pub type FilterPredicate = Arc<dyn Fn(&StructureOp) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStats {
    pub state: ModelState,
    pub session_id: Option<String>,
    pub content_count: usize,
    pub pending_tokens: usize,
    pub interned_payloads: usize,
    pub commit_count: u64,
    pub token_commit_count: u64,
    pub update_commit_count: u64,
    pub rejected_commit_count: u64,
}

#[derive(Debug, Default)]
struct CommitCounters {
    commits: u64,
    token_commits: u64,
    update_commits: u64,
    rejected: u64,
}

#[derive(Debug)]
struct CommitState {
    state: ModelState,
    session_id: Option<String>,
    tokens: TokenRegistry,
    /// End of the last page exposed by synthetic paging.
    paged_until: usize,
    counters: CommitCounters,
}

type FeedObservers = SubscriptionRegistry<(), dyn FeedObserver>;
type TokenObservers = SubscriptionRegistry<ContentId, dyn TokenCompletedObserver>;

pub struct FeedModel {
    config: FeedConfig,
    store: Arc<ContentTreeStore>,
    runner: Arc<dyn TaskRunner>,
    commit: Mutex<CommitState>,
    observers: Arc<FeedObservers>,
    token_observers: Arc<TokenObservers>,
    token_handler: RwLock<Option<Arc<dyn TokenHandler>>>,
    remove_tracking: RwLock<Option<RemoveTrackingFactory>>,
    filter: RwLock<Option<FilterPredicate>>,
}

impl std::fmt::Debug for FeedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedModel")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl FeedModel {
    pub fn new(config: FeedConfig, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            config,
            store: Arc::new(ContentTreeStore::new()),
            runner,
            commit: Mutex::new(CommitState {
                state: ModelState::Initializing,
                session_id: None,
                tokens: TokenRegistry::new(),
                paged_until: 0,
                counters: CommitCounters::default(),
            }),
            observers: Arc::new(SubscriptionRegistry::new()),
            token_observers: Arc::new(SubscriptionRegistry::new()),
            token_handler: RwLock::new(None),
            remove_tracking: RwLock::new(None),
            filter: RwLock::new(None),
        }
    }

    /// Starts a mutation committed against this model.
    pub fn edit(self: &Arc<Self>) -> MutationBuilder {
        MutationBuilder::new(self.clone())
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ContentTreeStore> {
        &self.store
    }

    pub fn state(&self) -> ModelState {
        self.commit.lock().state
    }

    pub fn session_id(&self) -> Option<String> {
        let session_id = self.commit.lock().session_id.clone();
        if session_id.is_none() {
            log::debug!("session id requested before the first session commit");
        }
        session_id
    }

    pub fn set_token_handler(&self, handler: Option<Arc<dyn TokenHandler>>) {
        *self.token_handler.write() = handler;
    }

    pub fn enable_remove_tracking(&self, factory: RemoveTrackingFactory) {
        *self.remove_tracking.write() = Some(factory);
    }

    pub fn set_filter_predicate(&self, filter: Option<FilterPredicate>) {
        *self.filter.write() = filter;
    }

    // Reads

    pub fn get_node(&self, content_id: &str) -> Option<Node> {
        self.store.get_node(content_id)
    }

    pub fn model_child(&self, content_id: &str) -> Option<Arc<ModelChild>> {
        self.store.model_child(content_id)
    }

    pub fn get_cursor(&self, parent_id: &str) -> Cursor {
        self.store.get_cursor(parent_id)
    }

    pub fn root_cursor(&self) -> Cursor {
        self.store.root_cursor()
    }

    pub fn root_ids(&self) -> Vec<ContentId> {
        self.store.root_ids()
    }

    /// Children of the first root, the list synthetic paging works on.
    pub fn all_root_children(&self) -> Vec<Arc<ModelChild>> {
        match self.store.root_ids().first() {
            Some(root) => self.store.get_cursor(root.as_str()).collect(),
            None => Vec::new(),
        }
    }

    /// Child of a root that contains `content_id`.
    pub fn root_child_ancestor(&self, content_id: &str) -> Option<ContentId> {
        self.store.root_child_ancestor(content_id)
    }

    pub fn shared_state(&self, content_id: &str) -> Option<Arc<Payload>> {
        self.store.shared_state(content_id)
    }

    pub fn stats(&self) -> ModelStats {
        let commit = self.commit.lock();
        ModelStats {
            state: commit.state,
            session_id: commit.session_id.clone(),
            content_count: self.store.len(),
            pending_tokens: commit.tokens.len(),
            interned_payloads: self.store.interner().size(),
            commit_count: commit.counters.commits,
            token_commit_count: commit.counters.token_commits,
            update_commit_count: commit.counters.update_commits,
            rejected_commit_count: commit.counters.rejected,
        }
    }

    // Observers

    /// Registers `observer`. A model that already started (or finished)
    /// reports that state to the new observer right away.
    pub fn register_observer(&self, observer: Arc<dyn FeedObserver>) -> SubscriptionId {
        let (id, state) = {
            let commit = self.commit.lock();
            (self.observers.subscribe((), observer.clone()), commit.state)
        };
        match state {
            ModelState::Ready => self
                .runner
                .execute("session_start", Box::new(move || observer.on_session_start())),
            ModelState::Invalidated => self.runner.execute(
                "session_finished",
                Box::new(move || observer.on_session_finished()),
            ),
            ModelState::Initializing => {}
        }
        id
    }

    pub fn unregister_observer(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(&(), id)
    }

    /// Observes completion of a pending token. `None` when the token is not pending.
    pub fn register_token_observer(
        &self,
        token_id: &str,
        observer: Arc<dyn TokenCompletedObserver>,
    ) -> Option<SubscriptionId> {
        let commit = self.commit.lock();
        let Some(entry) = commit.tokens.get(token_id) else {
            log::debug!("token observer for token that is not pending token_id={}", token_id);
            return None;
        };
        Some(self.token_observers.subscribe(entry.token_id.clone(), observer))
    }

    pub fn unregister_token_observer(&self, token_id: &str, id: SubscriptionId) -> bool {
        self.token_observers.unsubscribe(token_id, id)
    }

    // Tokens

    /// Commits `child_ops` as the continuation response of `token_id`.
    pub fn complete_token(
        &self,
        token_id: &str,
        child_ops: Vec<StructureOp>,
    ) -> Result<CommitOutcome> {
        self.commit(Change {
            structure_ops: child_ops,
            context: MutationContext::for_continuation(token_id),
        })
    }

    /// Asks for the content behind a pending token.
    ///
    /// Synthetic tokens are resolved locally. Network tokens go to the host
    /// `TokenHandler` together with the session id; without either this
    /// returns false.
    pub fn handle_token(&self, token_id: &str) -> bool {
        let mut tasks = Vec::new();
        let handled = {
            let mut guard = self.commit.lock();
            let commit = &mut *guard;
            if commit.state != ModelState::Ready {
                log::warn!(
                    "token not handled, model is {:?} token_id={}",
                    commit.state,
                    token_id
                );
                return false;
            }
            let Some(entry) = commit.tokens.get(token_id).cloned() else {
                log::warn!("token not handled, not pending token_id={}", token_id);
                return false;
            };
            if !entry.is_synthetic {
                let session_id = commit.session_id.clone();
                drop(guard);
                return self.forward_token(token_id, session_id);
            }

            match self.advance_synthetic_token(commit, &entry) {
                Some(completed) => {
                    tasks.push(("token_completed", self.token_completed_task(completed)));
                    true
                }
                None => {
                    let error = ModelError::synthetic_token(entry.token_id.clone());
                    tasks.push(("token_error", self.token_error_task(entry.token_id, error)));
                    false
                }
            }
        };
        self.dispatch(tasks);
        handled
    }

    fn forward_token(&self, token_id: &str, session_id: Option<String>) -> bool {
        let Some(session_id) = session_id else {
            log::warn!("token not forwarded, no session token_id={}", token_id);
            return false;
        };
        let Some(handler) = self.token_handler.read().clone() else {
            log::warn!("token not forwarded, no handler token_id={}", token_id);
            return false;
        };
        let Some(token) = self
            .store
            .model_child(token_id)
            .and_then(|child| child.token().cloned())
        else {
            log::warn!("token not forwarded, node missing token_id={}", token_id);
            return false;
        };
        log::debug!(
            "forwarding token token_id={} session_id={}",
            token_id,
            session_id
        );
        handler.handle_token(&session_id, &token);
        true
    }

    /// Replaces a synthetic token with the next page of its parent's children.
    fn advance_synthetic_token(
        &self,
        commit: &mut CommitState,
        entry: &TokenEntry,
    ) -> Option<TokenCompleted> {
        let parent = &entry.parent_content_id;
        let token_id = &entry.token_id;
        let mut position = 0;
        let staged = self
            .store
            .apply_then(Vec::new(), &MutationContext::default(), |staging| {
                position = staging
                    .position_of(parent, token_id)
                    .ok_or_else(|| FeedError::MissingTarget(token_id.clone()))?;
                staging.apply_op(StructureOp::remove(token_id.clone(), Some(parent.clone())))?;
                let child_count = staging.child_count(parent);
                if let Some(window) =
                    self.plan_page(commit, child_count, position, self.config.page_size)
                {
                    self.stage_synthetic_token(staging, parent, window);
                }
                Ok(())
            });
        let applied = match staged {
            Ok(applied) => applied,
            Err(error) => {
                log::error!(
                    "unable to advance synthetic token token_id={} error={}",
                    token_id,
                    error
                );
                commit.tokens.discard(token_id.as_str());
                return None;
            }
        };

        commit.tokens.complete(token_id.as_str());
        for token in applied.added_tokens() {
            commit.tokens.register(token);
        }
        Some(TokenCompleted::new(
            token_id.clone(),
            parent.clone(),
            self.store.child_snapshot(Some(parent)),
            position,
        ))
    }

    /// Reports a failure for `error.token_id`, or for the whole session when
    /// the error is not tied to a token. Returns false if nobody can receive it.
    pub fn raise_error(&self, error: ModelError) -> bool {
        match error.kind {
            ModelErrorKind::Pagination | ModelErrorKind::SyntheticToken => {
                let Some(token_id) = error.token_id.clone() else {
                    log::error!("token error without token message={}", error.message);
                    return false;
                };
                if !self.commit.lock().tokens.contains(token_id.as_str()) {
                    log::error!("token observer not found for error token_id={}", token_id);
                    return false;
                }
                let task = self.token_error_task(token_id, error);
                self.dispatch(vec![("token_error", task)]);
                true
            }
            ModelErrorKind::NoCards => {
                let task = self.feed_observers_task(move |observer| observer.on_error(&error));
                self.dispatch(vec![("feed_error", task)]);
                true
            }
        }
    }

    pub fn raise_pagination_error(&self, token_id: &str, message: impl Into<String>) -> bool {
        self.raise_error(ModelError::pagination(token_id, message))
    }

    // Lifecycle

    /// Ends the session: clears the tree, discards every pending token and
    /// notifies observers. Returns false when already invalidated.
    pub fn invalidate(&self) -> bool {
        self.invalidate_with(|| {})
    }

    /// Same as `invalidate`, running `on_invalidate` inside the same critical
    /// section so session-scoped state elsewhere is dropped atomically.
    pub(crate) fn invalidate_with(&self, on_invalidate: impl FnOnce()) -> bool {
        let task = {
            let mut guard = self.commit.lock();
            let commit = &mut *guard;
            if commit.state == ModelState::Invalidated {
                log::info!("invalidating an already invalid feed model");
                return false;
            }
            log::info!(
                "feed model invalidated session_id={}",
                commit.session_id.as_deref().unwrap_or("none")
            );
            commit.state = ModelState::Invalidated;
            commit.paged_until = 0;
            for entry in commit.tokens.invalidate_all() {
                self.token_observers.remove_key(&entry.token_id);
            }
            self.store.clear();
            on_invalidate();
            self.feed_observers_task(|observer| observer.on_session_finished())
        };
        self.dispatch(vec![("session_finished", task)]);
        true
    }

    // Internals

    fn dispatch(&self, tasks: Vec<(&'static str, Task)>) {
        for (name, task) in tasks {
            self.runner.execute(name, task);
        }
    }

    /// Notifies the feed observers subscribed at call time. Built under the
    /// commit lock, an observer registered after the commit only gets its
    /// catch-up notification from `register_observer`.
    fn feed_observers_task<N>(&self, notify: N) -> Task
    where
        N: Fn(&dyn FeedObserver) + Send + 'static,
    {
        let observers = self.observers.clone();
        let snapshot = observers.subscribers(&());
        Box::new(move || {
            observers.deliver_to(&(), snapshot, |observer| notify(observer));
        })
    }

    /// Detaches the token's observers now; a later token reusing the id
    /// starts with no observers.
    fn token_completed_task(&self, completed: TokenCompleted) -> Task {
        let subscriptions: Vec<Subscription<dyn TokenCompletedObserver>> =
            self.token_observers.remove_key(completed.token_id());
        Box::new(move || {
            for subscription in subscriptions {
                subscription.handler.on_token_completed(&completed);
            }
        })
    }

    fn token_error_task(&self, token_id: ContentId, error: ModelError) -> Task {
        let observers = self.token_observers.clone();
        Box::new(move || {
            observers.deliver(&token_id, |observer| observer.on_error(&error));
        })
    }

    /// Next page of `child_count` children from `start`, or `None` when
    /// everything from `start` on is already exposed.
    fn plan_page(
        &self,
        commit: &mut CommitState,
        child_count: usize,
        start: usize,
        page_size: usize,
    ) -> Option<PageWindow> {
        if start >= child_count {
            commit.paged_until = child_count;
            return None;
        }
        let window = paging::page_window(child_count, start, page_size, self.config.min_page_size);
        commit.paged_until = window.end;
        window.insert_token.then_some(window)
    }

    /// Pages the first root's children at the end of a commit, unless a
    /// synthetic token is still waiting in the staged tree.
    fn page_root_children(
        &self,
        commit: &mut CommitState,
        staging: &mut Staging<'_>,
    ) -> Option<ContentId> {
        if !self.config.paging_enabled() {
            return None;
        }
        if let Some(pending) = commit.tokens.pending_synthetic() {
            if staging.contains(&pending.token_id) {
                return None;
            }
        }
        let root = staging.first_root()?;
        let child_count = staging.child_count(&root);
        let start = commit.paged_until;
        let page_size = if start < self.config.initial_page_size {
            self.config.initial_page_size
        } else {
            self.config.page_size
        };
        let window = self.plan_page(commit, child_count, start, page_size)?;
        self.stage_synthetic_token(staging, &root, window)
    }

    fn stage_synthetic_token(
        &self,
        staging: &mut Staging<'_>,
        parent: &ContentId,
        window: PageWindow,
    ) -> Option<ContentId> {
        let op = paging::synthetic_token_op(parent);
        match staging.insert_at(op, window.end) {
            Ok(token) => {
                log::info!(
                    "synthetic token staged token_id={} page_start={} position={}",
                    token.content_id,
                    window.start,
                    window.end
                );
                Some(token.content_id.clone())
            }
            Err(error) => {
                log::error!(
                    "unable to insert synthetic token parent={} error={}",
                    parent,
                    error
                );
                None
            }
        }
    }
}

impl Committer for FeedModel {
    fn commit(&self, change: Change) -> Result<CommitOutcome> {
        let Change {
            mut structure_ops,
            context,
        } = change;
        let mut tasks: Vec<(&'static str, Task)> = Vec::new();

        let outcome = {
            let mut guard = self.commit.lock();
            let commit = &mut *guard;

            if commit.state == ModelState::Invalidated {
                log::warn!(
                    "commit rejected, model invalidated ops={}",
                    structure_ops.len()
                );
                return Err(FeedError::Invalidated);
            }
            if let (Some(expected), Some(actual)) = (&commit.session_id, &context.session_id) {
                if expected != actual {
                    commit.counters.rejected += 1;
                    log::warn!(
                        "commit rejected, session mismatch expected={} actual={}",
                        expected,
                        actual
                    );
                    return Err(FeedError::SessionMismatch {
                        expected: expected.clone(),
                        actual: actual.clone(),
                    });
                }
            }
            if let Some(token_id) = &context.continuation_token {
                if !commit.tokens.contains(token_id.as_str()) {
                    log::debug!(
                        "continuation for token that is no longer pending token_id={}",
                        token_id
                    );
                    return Ok(CommitOutcome::StaleContinuation(token_id.clone()));
                }
            }

            if let Some(filter) = self.filter.read().as_ref() {
                let before = structure_ops.len();
                structure_ops.retain(|op| filter(op));
                if structure_ops.len() != before {
                    log::debug!(
                        "filter dropped structure ops count={}",
                        before - structure_ops.len()
                    );
                }
            }

            let has_removals = structure_ops.iter().any(|op| op.kind == OpKind::Remove);
            let tracker = if has_removals {
                self.remove_tracking
                    .read()
                    .as_ref()
                    .and_then(|factory| factory(&context))
            } else {
                None
            };

            let op_count = structure_ops.len();
            let mut synthetic_token = None;
            let staged = self.store.apply_then(structure_ops, &context, |staging| {
                synthetic_token = self.page_root_children(commit, staging);
                Ok(())
            });
            let applied = match staged {
                Ok(applied) => applied,
                Err(error) => {
                    commit.counters.rejected += 1;
                    log::warn!("commit rejected ops={} error={}", op_count, error);
                    return Err(error);
                }
            };

            for token in applied.removed_tokens() {
                if commit.tokens.discard(token.content_id.as_str()).is_some() {
                    self.token_observers.remove_key(&token.content_id);
                }
            }
            for token in applied.added_tokens() {
                commit.tokens.register(token);
            }
            let completed = applied.splice.as_ref().and_then(|splice| {
                commit
                    .tokens
                    .complete(splice.token.content_id.as_str())
                    .map(|_| splice)
            });

            if let Some(mut tracker) = tracker {
                for removed in &applied.removed {
                    tracker.filter(removed);
                }
                tasks.push((
                    "remove_tracking",
                    Box::new(move || tracker.trigger_consumer_update()),
                ));
            }

            if let Some(session_id) = &context.session_id {
                if commit.session_id.is_none() {
                    log::info!("feed model session adopted session_id={}", session_id);
                    commit.session_id = Some(session_id.clone());
                }
            }

            commit.counters.commits += 1;
            if context.continuation_token.is_some() {
                commit.counters.token_commits += 1;
            } else if commit.state == ModelState::Ready {
                commit.counters.update_commits += 1;
            }

            if commit.state == ModelState::Initializing {
                commit.state = ModelState::Ready;
                log::info!("feed model ready content_count={}", self.store.len());
                tasks.push((
                    "session_start",
                    self.feed_observers_task(|observer| observer.on_session_start()),
                ));
            }

            if let Some(splice) = completed {
                let token_completed = TokenCompleted::new(
                    splice.token.content_id.clone(),
                    splice.parent_id.clone(),
                    self.store.child_snapshot(Some(&splice.parent_id)),
                    splice.position,
                );
                tasks.push(("token_completed", self.token_completed_task(token_completed)));
            }

            // Synthetic tokens are paging artifacts, not content.
            let added = applied
                .added
                .iter()
                .filter(|child| !child.is_synthetic)
                .count();
            if added > 0 || !applied.updated.is_empty() {
                let is_refresh = context.continuation_token.is_none();
                let timestamp_ms = chrono::Utc::now().timestamp_millis();
                tasks.push((
                    "new_content",
                    self.feed_observers_task(move |observer| {
                        observer.on_new_content_received(is_refresh, timestamp_ms)
                    }),
                ));
            }

            log::info!(
                "feed model commit structure_changes={} added={} updated={} removed={} token={} cached_bindings={}",
                op_count,
                added,
                applied.updated.len(),
                applied.removed.len(),
                context.continuation_token.is_some(),
                context.cached_bindings
            );

            CommitOutcome::Applied(CommitSummary {
                added,
                updated: applied.updated.len(),
                removed: applied.removed.len(),
                completed_token: applied
                    .splice
                    .as_ref()
                    .map(|splice| splice.token.content_id.clone()),
                synthetic_token,
                cached_bindings: context.cached_bindings,
            })
        };

        self.dispatch(tasks);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{InlineRunner, QueueRunner};
    use crate::removal::{RemovalTracker, RemoveTracking};

    #[derive(Default)]
    struct FeedEvents {
        events: Mutex<Vec<String>>,
    }

    impl FeedEvents {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl FeedObserver for FeedEvents {
        fn on_session_start(&self) {
            self.events.lock().push("start".to_string());
        }

        fn on_session_finished(&self) {
            self.events.lock().push("finished".to_string());
        }

        fn on_error(&self, error: &ModelError) {
            self.events.lock().push(format!("error:{:?}", error.kind));
        }

        fn on_new_content_received(&self, is_refresh: bool, timestamp_ms: i64) {
            assert!(timestamp_ms > 0);
            self.events.lock().push(format!("content refresh={is_refresh}"));
        }
    }

    #[derive(Default)]
    struct TokenEvents {
        completed: Mutex<Vec<Vec<String>>>,
        errors: Mutex<Vec<ModelError>>,
    }

    impl TokenCompletedObserver for TokenEvents {
        fn on_token_completed(&self, completed: &TokenCompleted) {
            let ids = completed
                .cursor()
                .map(|child| child.content_id.to_string())
                .collect();
            self.completed.lock().push(ids);
        }

        fn on_error(&self, error: &ModelError) {
            self.errors.lock().push(error.clone());
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl TokenHandler for RecordingHandler {
        fn handle_token(&self, session_id: &str, token: &StreamToken) {
            self.calls
                .lock()
                .push((session_id.to_string(), token.next_page_token.clone()));
        }
    }

    fn model(config: FeedConfig) -> Arc<FeedModel> {
        Arc::new(FeedModel::new(config, Arc::new(InlineRunner)))
    }

    fn feature(id: &str) -> Payload {
        Payload::feature(id.as_bytes().to_vec())
    }

    fn seed(model: &Arc<FeedModel>, children: usize) {
        let mut builder = model
            .edit()
            .set_session_id("s1")
            .add_child("root", None, feature("root"));
        for i in 0..children {
            builder = builder.add_child(format!("c{i}"), Some("root".into()), feature(&format!("c{i}")));
        }
        builder.commit().unwrap();
    }

    fn child_ids(cursor: Cursor) -> Vec<String> {
        cursor.map(|child| child.content_id.to_string()).collect()
    }

    fn add_network_token(model: &Arc<FeedModel>, token_id: &str) {
        model
            .edit()
            .add_child(token_id, Some("root".into()), Payload::token(b"next".to_vec()))
            .commit()
            .unwrap();
    }

    #[test]
    fn first_commit_starts_session() {
        let model = model(FeedConfig::default());
        let events = Arc::new(FeedEvents::default());
        model.register_observer(events.clone());
        assert_eq!(model.state(), ModelState::Initializing);

        seed(&model, 2);

        assert_eq!(model.state(), ModelState::Ready);
        assert_eq!(model.session_id().as_deref(), Some("s1"));
        assert_eq!(events.take(), vec!["start", "content refresh=true"]);
        assert_eq!(child_ids(model.get_cursor("root")), vec!["c0", "c1"]);
    }

    #[test]
    fn late_observer_hears_current_state() {
        let model = model(FeedConfig::default());
        seed(&model, 1);
        let events = Arc::new(FeedEvents::default());
        model.register_observer(events.clone());
        assert_eq!(events.take(), vec!["start"]);

        model.invalidate();
        let late = Arc::new(FeedEvents::default());
        model.register_observer(late.clone());
        assert_eq!(late.take(), vec!["finished"]);
    }

    #[test]
    fn session_mismatch_is_rejected() {
        let model = model(FeedConfig::default());
        seed(&model, 1);

        let error = model
            .edit()
            .set_session_id("other")
            .add_child("x", Some("root".into()), feature("x"))
            .commit()
            .unwrap_err();

        assert!(matches!(error, FeedError::SessionMismatch { .. }));
        assert!(model.get_node("x").is_none());
        assert_eq!(model.stats().rejected_commit_count, 1);
    }

    #[test]
    fn malformed_batch_leaves_model_unchanged() {
        let model = model(FeedConfig::default());
        seed(&model, 1);

        let error = model
            .edit()
            .add_child("ok", Some("root".into()), feature("ok"))
            .add_child("x", Some("absent".into()), feature("x"))
            .commit()
            .unwrap_err();

        assert!(error.is_malformed_batch());
        assert!(model.get_node("x").is_none());
        assert!(model.get_node("ok").is_none());
    }

    #[test]
    fn invalidate_is_terminal() {
        let model = model(FeedConfig::default());
        let events = Arc::new(FeedEvents::default());
        model.register_observer(events.clone());
        seed(&model, 1);
        add_network_token(&model, "t1");
        events.take();

        assert!(model.invalidate());
        assert!(!model.invalidate());
        assert_eq!(events.take(), vec!["finished"]);
        assert_eq!(model.state(), ModelState::Invalidated);
        assert!(model.store().is_empty());
        assert_eq!(model.stats().pending_tokens, 0);

        let error = model
            .complete_token("t1", vec![StructureOp::add_child("root", "a", feature("a"))])
            .unwrap_err();
        assert!(matches!(error, FeedError::Invalidated));
    }

    #[test]
    fn continuation_splices_and_notifies_once() {
        let model = model(FeedConfig::default());
        seed(&model, 2);
        add_network_token(&model, "t1");
        let observer = Arc::new(TokenEvents::default());
        model
            .register_token_observer("t1", observer.clone())
            .unwrap();

        let events = Arc::new(FeedEvents::default());
        model.register_observer(events.clone());
        events.take();

        let outcome = model
            .complete_token(
                "t1",
                vec![
                    StructureOp::add_child("root", "p1", feature("p1")),
                    StructureOp::add_child("root", "p2", feature("p2")),
                ],
            )
            .unwrap();
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.completed_token.as_ref().map(ContentId::as_str), Some("t1"));
        assert_eq!(summary.added, 2);

        let second = model
            .complete_token("t1", vec![StructureOp::add_child("root", "p3", feature("p3"))])
            .unwrap();
        assert!(matches!(second, CommitOutcome::StaleContinuation(_)));

        assert_eq!(*observer.completed.lock(), vec![vec!["p1", "p2"]]);
        assert_eq!(
            child_ids(model.get_cursor("root")),
            vec!["c0", "c1", "p1", "p2"]
        );
        assert!(model.get_node("p3").is_none());
        assert_eq!(events.take(), vec!["content refresh=false"]);
        assert_eq!(model.stats().token_commit_count, 1);
    }

    #[test]
    fn network_token_goes_to_host_handler() {
        let model = model(FeedConfig::default());
        seed(&model, 1);
        add_network_token(&model, "t1");
        assert!(!model.handle_token("t1"));

        let handler = Arc::new(RecordingHandler::default());
        model.set_token_handler(Some(handler.clone() as Arc<dyn TokenHandler>));
        assert!(model.handle_token("t1"));
        assert!(!model.handle_token("missing"));
        assert_eq!(
            *handler.calls.lock(),
            vec![("s1".to_string(), b"next".to_vec())]
        );
    }

    #[test]
    fn synthetic_tokens_page_through_root_children() {
        let model = model(FeedConfig::paged(3, 2, 0));
        let handler = Arc::new(RecordingHandler::default());
        model.set_token_handler(Some(handler.clone() as Arc<dyn TokenHandler>));
        seed(&model, 7);

        let children = model.all_root_children();
        assert_eq!(children.len(), 8);
        let first_token = children[3].clone();
        assert!(first_token.is_token() && first_token.is_synthetic);
        assert!(paging::is_synthetic_token_id(first_token.content_id.as_str()));

        let observer = Arc::new(TokenEvents::default());
        model
            .register_token_observer(first_token.content_id.as_str(), observer.clone())
            .unwrap();
        assert!(model.handle_token(first_token.content_id.as_str()));

        let completed = observer.completed.lock().clone();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0][..2], ["c3".to_string(), "c4".to_string()]);
        assert!(paging::is_synthetic_token_id(&completed[0][2]));
        assert_eq!(completed[0][3..], ["c5".to_string(), "c6".to_string()]);

        let second_token = completed[0][2].clone();
        assert!(model.handle_token(&second_token));
        assert_eq!(
            child_ids(model.get_cursor("root")),
            vec!["c0", "c1", "c2", "c3", "c4", "c5", "c6"]
        );
        assert_eq!(model.stats().pending_tokens, 0);
        assert!(handler.calls.lock().is_empty());
    }

    #[test]
    fn short_feed_gets_no_synthetic_token() {
        let model = model(FeedConfig::paged(5, 5, 2));
        seed(&model, 6);
        assert_eq!(model.all_root_children().len(), 6);
        assert_eq!(model.stats().pending_tokens, 0);
    }

    #[test]
    fn removal_tracker_reports_removed_content() {
        let model = model(FeedConfig::default());
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        model.enable_remove_tracking(Arc::new(move |_context: &MutationContext| {
            let sink = sink.clone();
            Some(Box::new(RemovalTracker::new(
                |child: &ModelChild| Some(child.content_id.to_string()),
                move |ids: Vec<String>| sink.lock().push(ids),
            )) as Box<dyn RemoveTracking>)
        }));
        seed(&model, 2);
        assert!(reports.lock().is_empty());

        model
            .edit()
            .remove_child("c1", Some("root".into()))
            .commit()
            .unwrap();
        assert_eq!(*reports.lock(), vec![vec!["c1".to_string()]]);
    }

    #[test]
    fn removed_token_is_discarded() {
        let model = model(FeedConfig::default());
        seed(&model, 1);
        add_network_token(&model, "t1");
        model
            .edit()
            .remove_child("t1", Some("root".into()))
            .commit()
            .unwrap();

        assert_eq!(model.stats().pending_tokens, 0);
        let outcome = model.complete_token("t1", Vec::new()).unwrap();
        assert!(matches!(outcome, CommitOutcome::StaleContinuation(_)));
    }

    #[test]
    fn filter_predicate_drops_ops() {
        let model = model(FeedConfig::default());
        let filter: FilterPredicate =
            Arc::new(|op: &StructureOp| !op.content_id.as_str().starts_with("ad-"));
        model.set_filter_predicate(Some(filter));
        model
            .edit()
            .add_child("root", None, feature("root"))
            .add_child("ad-1", Some("root".into()), feature("ad"))
            .add_child("c0", Some("root".into()), feature("c0"))
            .commit()
            .unwrap();
        assert_eq!(child_ids(model.get_cursor("root")), vec!["c0"]);
    }

    #[test]
    fn pagination_error_reaches_token_observers() {
        let model = model(FeedConfig::default());
        seed(&model, 1);
        add_network_token(&model, "t1");
        let observer = Arc::new(TokenEvents::default());
        model
            .register_token_observer("t1", observer.clone())
            .unwrap();

        assert!(model.raise_pagination_error("t1", "timeout"));
        assert!(!model.raise_pagination_error("unknown", "timeout"));
        assert_eq!(observer.errors.lock().len(), 1);
        assert!(model.register_token_observer("unknown", observer.clone()).is_none());

        let events = Arc::new(FeedEvents::default());
        model.register_observer(events.clone());
        events.take();
        assert!(model.raise_error(ModelError::no_cards("empty feed")));
        assert_eq!(events.take(), vec!["error:NoCards"]);
    }

    #[test]
    fn observers_may_call_back_into_the_model() {
        struct Reentrant {
            model: Mutex<Option<Arc<FeedModel>>>,
            seen: Mutex<Vec<usize>>,
        }

        impl FeedObserver for Reentrant {
            fn on_new_content_received(&self, _is_refresh: bool, _timestamp_ms: i64) {
                if let Some(model) = self.model.lock().as_ref() {
                    self.seen.lock().push(model.stats().content_count);
                }
            }
        }

        let model = model(FeedConfig::default());
        let observer = Arc::new(Reentrant {
            model: Mutex::new(Some(model.clone())),
            seen: Mutex::new(Vec::new()),
        });
        model.register_observer(observer.clone());
        seed(&model, 2);
        assert_eq!(*observer.seen.lock(), vec![3]);
        observer.model.lock().take();
    }

    #[test]
    fn root_child_ancestor_and_stats() {
        let model = model(FeedConfig::default());
        seed(&model, 1);
        model
            .edit()
            .add_child("c0-a", Some("c0".into()), feature("c0-a"))
            .commit()
            .unwrap();

        assert_eq!(
            model.root_child_ancestor("c0-a").map(|id| id.to_string()),
            Some("c0".to_string())
        );

        let stats = model.stats();
        assert_eq!(stats.commit_count, 2);
        assert_eq!(stats.update_commit_count, 1);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "ready");
        assert_eq!(json["content_count"], 3);
    }

    #[test]
    fn readers_never_see_an_unpaged_list() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let model = model(FeedConfig::paged(3, 2, 0));
        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let model = model.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    let seen = model.get_cursor("root").count();
                    assert!(seen == 0 || seen == 8, "observed unpaged list: {seen}");
                }
            })
        };

        seed(&model, 7);
        let token = model.all_root_children()[3].content_id.clone();
        assert!(model.handle_token(token.as_str()));
        done.store(true, Ordering::SeqCst);
        reader.join().unwrap();

        assert_eq!(model.get_cursor("root").count(), 8);
        assert_eq!(model.stats().pending_tokens, 1);
    }

    #[test]
    fn synthetic_token_is_not_counted_as_content() {
        let model = model(FeedConfig::paged(3, 2, 0));
        let outcome = model
            .edit()
            .add_child("root", None, feature("root"))
            .add_child("c0", Some("root".into()), feature("c0"))
            .add_child("c1", Some("root".into()), feature("c1"))
            .add_child("c2", Some("root".into()), feature("c2"))
            .add_child("c3", Some("root".into()), feature("c3"))
            .commit()
            .unwrap();
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.added, 5);
        let token = summary.synthetic_token.clone().unwrap();
        assert_eq!(model.store().position_of("root", token.as_str()), Some(3));
    }

    #[tokio::test]
    async fn reused_token_id_keeps_its_own_observers() {
        let (runner, mut queue) = QueueRunner::new();
        let model = Arc::new(FeedModel::new(FeedConfig::default(), Arc::new(runner)));
        seed(&model, 1);
        add_network_token(&model, "t1");
        let first = Arc::new(TokenEvents::default());
        model.register_token_observer("t1", first.clone()).unwrap();
        model
            .complete_token("t1", vec![StructureOp::add_child("root", "p1", feature("p1"))])
            .unwrap();

        add_network_token(&model, "t1");
        let second = Arc::new(TokenEvents::default());
        model.register_token_observer("t1", second.clone()).unwrap();
        queue.run_pending();

        assert_eq!(*first.completed.lock(), vec![vec!["p1"]]);
        assert!(second.completed.lock().is_empty());

        model
            .complete_token("t1", vec![StructureOp::add_child("root", "p2", feature("p2"))])
            .unwrap();
        queue.run_pending();
        assert_eq!(*second.completed.lock(), vec![vec!["p2"]]);
        assert_eq!(first.completed.lock().len(), 1);
    }

    #[tokio::test]
    async fn observer_registered_after_commit_starts_once() {
        let (runner, mut queue) = QueueRunner::new();
        let model = Arc::new(FeedModel::new(FeedConfig::default(), Arc::new(runner)));
        seed(&model, 1);
        let events = Arc::new(FeedEvents::default());
        model.register_observer(events.clone());

        assert_eq!(queue.run_pending(), 3);
        assert_eq!(events.take(), vec!["start"]);
    }

    #[tokio::test]
    async fn queued_notifications_run_on_the_queue() {
        let (runner, mut queue) = QueueRunner::new();
        let model = Arc::new(FeedModel::new(FeedConfig::default(), Arc::new(runner)));
        let events = Arc::new(FeedEvents::default());
        model.register_observer(events.clone());

        seed(&model, 1);
        assert!(events.take().is_empty());

        assert_eq!(queue.run_pending(), 2);
        assert_eq!(events.take(), vec!["start", "content refresh=true"]);
    }
}
