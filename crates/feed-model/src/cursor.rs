//! Snapshot cursors over a node's children.
//!
//! A cursor holds the child-order list that was installed when it was
//! created. Commits replace lists wholesale instead of editing them, so a
//! cursor never sees a later commit and never sees half of one.

use std::iter::FusedIterator;
use std::sync::Arc;

use thin_vec::ThinVec;

use crate::types::{ContentId, ModelChild};

/// Shared, immutable child-order list.
pub(crate) type ChildList = Arc<ThinVec<Arc<ModelChild>>>;

/// Forward-only iterator over a snapshot of a parent's children.
///
/// TOKEN children are yielded as-is; the cursor never descends into them.
#[derive(Debug)]
pub struct Cursor {
    parent_id: Option<ContentId>,
    children: ChildList,
    position: usize,
}

impl Cursor {
    pub(crate) fn new(parent_id: Option<ContentId>, children: ChildList) -> Self {
        Self::starting_at(parent_id, children, 0)
    }

    pub(crate) fn starting_at(
        parent_id: Option<ContentId>,
        children: ChildList,
        position: usize,
    ) -> Self {
        let position = position.min(children.len());
        Self {
            parent_id,
            children,
            position,
        }
    }

    pub(crate) fn empty(parent_id: Option<ContentId>) -> Self {
        Self::new(parent_id, Arc::new(ThinVec::new()))
    }

    /// Parent whose children this cursor walks; `None` for the root list.
    pub fn parent_id(&self) -> Option<&ContentId> {
        self.parent_id.as_ref()
    }

    pub fn is_at_end(&self) -> bool {
        self.position >= self.children.len()
    }

    /// Number of children not yet yielded.
    pub fn remaining(&self) -> usize {
        self.children.len() - self.position
    }
}

impl Iterator for Cursor {
    type Item = Arc<ModelChild>;

    fn next(&mut self) -> Option<Self::Item> {
        let child = self.children.get(self.position)?.clone();
        self.position += 1;
        Some(child)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Cursor {}

impl FusedIterator for Cursor {}
