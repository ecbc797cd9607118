//! Pending continuation tokens and their completion notifications.
//!
//! A token is `Pending` from the commit that adds it until it is either
//! completed (spliced) or discarded (removed or invalidated). Both ends are
//! terminal: a token id that is no longer pending turns every later
//! completion into a no-op.

use fnv::FnvHashMap;

use crate::cursor::{ChildList, Cursor};
use crate::error::ModelError;
use crate::types::{ContentId, ModelChild};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEntry {
    pub token_id: ContentId,
    pub parent_content_id: ContentId,
    /// Synthetic tokens page through local content and never reach the network.
    pub is_synthetic: bool,
}

/// Delivered once to each observer of a completed token.
#[derive(Debug, Clone)]
pub struct TokenCompleted {
    token_id: ContentId,
    parent_id: ContentId,
    children: ChildList,
    position: usize,
}

impl TokenCompleted {
    pub(crate) fn new(
        token_id: ContentId,
        parent_id: ContentId,
        children: ChildList,
        position: usize,
    ) -> Self {
        Self {
            token_id,
            parent_id,
            children,
            position,
        }
    }

    pub fn token_id(&self) -> &ContentId {
        &self.token_id
    }

    pub fn parent_id(&self) -> &ContentId {
        &self.parent_id
    }

    /// Fresh cursor over the parent's children, starting where the token was.
    pub fn cursor(&self) -> Cursor {
        Cursor::starting_at(
            Some(self.parent_id.clone()),
            self.children.clone(),
            self.position,
        )
    }
}

pub trait TokenCompletedObserver: Send + Sync {
    fn on_token_completed(&self, completed: &TokenCompleted);

    fn on_error(&self, _error: &ModelError) {}
}

/// Pending tokens of one session. Guarded by the model's commit lock.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    pending: FnvHashMap<ContentId, TokenEntry>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly added TOKEN node. Returns false for anything else.
    pub fn register(&mut self, child: &ModelChild) -> bool {
        if !child.is_token() {
            return false;
        }
        let Some(parent) = child.parent_id.clone() else {
            return false;
        };
        log::debug!(
            "token registered token_id={} parent={} synthetic={}",
            child.content_id,
            parent,
            child.is_synthetic
        );
        self.pending.insert(
            child.content_id.clone(),
            TokenEntry {
                token_id: child.content_id.clone(),
                parent_content_id: parent,
                is_synthetic: child.is_synthetic,
            },
        );
        true
    }

    pub fn get(&self, token_id: &str) -> Option<&TokenEntry> {
        self.pending.get(token_id)
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.pending.contains_key(token_id)
    }

    /// Moves a pending token to completed. `None` when it already left `Pending`.
    pub fn complete(&mut self, token_id: &str) -> Option<TokenEntry> {
        let entry = self.pending.remove(token_id);
        if entry.is_none() {
            log::debug!("duplicate token completion ignored token_id={}", token_id);
        }
        entry
    }

    /// Drops a token whose node left the tree.
    pub fn discard(&mut self, token_id: &str) -> Option<TokenEntry> {
        self.pending.remove(token_id)
    }

    /// Discards every pending token, e.g. on session invalidation.
    pub fn invalidate_all(&mut self) -> Vec<TokenEntry> {
        self.pending.drain().map(|(_, entry)| entry).collect()
    }

    pub fn pending_synthetic(&self) -> Option<&TokenEntry> {
        self.pending.values().find(|entry| entry.is_synthetic)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
