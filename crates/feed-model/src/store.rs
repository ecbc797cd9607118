//! Authoritative content tree with atomic batch apply.
//!
//! ## Write path
//!
//! Writers are serialized by `writer`. A batch is replayed against a
//! `Staging` overlay that borrows the installed `TreeState` read-only and
//! clones a child-order list the first time an operation touches it. Any
//! validation failure drops the overlay, so a rejected batch leaves no trace
//! in the tree. A fully validated overlay is installed under a short write
//! lock.
//!
//! ## Read path
//!
//! Readers take the read lock only long enough to clone an `Arc`. Because
//! installed lists are never edited in place, cursors keep reading the list
//! they started with.

use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::{Mutex, RwLock};
use thin_vec::ThinVec;

use crate::cursor::{ChildList, Cursor};
use crate::error::{FeedError, Result};
use crate::interner::{InternedMap, Interner};
use crate::types::{
    ContentId, ModelChild, MutationContext, Node, NodeKind, OpKind, Payload, StructureOp,
};

#[derive(Debug, Default)]
struct TreeState {
    nodes: FnvHashMap<ContentId, Arc<ModelChild>>,
    children: FnvHashMap<ContentId, ChildList>,
    roots: ChildList,
}

impl TreeState {
    fn child_list(&self, parent: Option<&ContentId>) -> Option<ChildList> {
        match parent {
            Some(parent) => self.children.get(parent).cloned(),
            None => Some(self.roots.clone()),
        }
    }
}

/// A TOKEN node replaced in place by a continuation response.
#[derive(Debug, Clone)]
pub struct Splice {
    pub token: Arc<ModelChild>,
    pub parent_id: ContentId,
    /// Index the token occupied; the first spliced child lands here.
    pub position: usize,
}

/// What a successful `apply` changed.
#[derive(Debug, Default)]
pub struct AppliedBatch {
    pub added: Vec<Arc<ModelChild>>,
    pub updated: Vec<Arc<ModelChild>>,
    /// Detached nodes in pre-order, each removal target before its descendants.
    pub removed: Vec<Arc<ModelChild>>,
    pub splice: Option<Splice>,
}

impl AppliedBatch {
    pub fn added_tokens(&self) -> impl Iterator<Item = &Arc<ModelChild>> {
        self.added.iter().filter(|child| child.is_token())
    }

    pub fn removed_tokens(&self) -> impl Iterator<Item = &Arc<ModelChild>> {
        self.removed.iter().filter(|child| child.is_token())
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.splice.is_none()
    }
}

/// Where the next spliced child goes. Both indexes follow removals of
/// earlier siblings made by the same batch.
struct SpliceCursor {
    parent_id: ContentId,
    start: usize,
    next: usize,
}

/// Copy-on-write overlay a batch is validated against.
pub(crate) struct Staging<'a> {
    base: &'a TreeState,
    interner: &'a Interner<Payload>,
    nodes: FnvHashMap<ContentId, Option<Arc<ModelChild>>>,
    children: FnvHashMap<ContentId, Option<ThinVec<Arc<ModelChild>>>>,
    roots: Option<ThinVec<Arc<ModelChild>>>,
    splice_cursor: Option<SpliceCursor>,
    applied: AppliedBatch,
}

struct StagedChanges {
    nodes: FnvHashMap<ContentId, Option<Arc<ModelChild>>>,
    children: FnvHashMap<ContentId, Option<ThinVec<Arc<ModelChild>>>>,
    roots: Option<ThinVec<Arc<ModelChild>>>,
    applied: AppliedBatch,
}

impl<'a> Staging<'a> {
    fn new(base: &'a TreeState, interner: &'a Interner<Payload>) -> Self {
        Self {
            base,
            interner,
            nodes: FnvHashMap::default(),
            children: FnvHashMap::default(),
            roots: None,
            splice_cursor: None,
            applied: AppliedBatch::default(),
        }
    }

    fn node(&self, id: &ContentId) -> Option<Arc<ModelChild>> {
        match self.nodes.get(id) {
            Some(staged) => staged.clone(),
            None => self.base.nodes.get(id).cloned(),
        }
    }

    fn list(&self, parent: &ContentId) -> Option<&ThinVec<Arc<ModelChild>>> {
        match self.children.get(parent) {
            Some(staged) => staged.as_ref(),
            None => self.base.children.get(parent).map(|list| &**list),
        }
    }

    fn children_of(&self, parent: &ContentId) -> Vec<Arc<ModelChild>> {
        self.list(parent)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn contains(&self, id: &ContentId) -> bool {
        self.node(id).is_some()
    }

    pub(crate) fn first_root(&self) -> Option<ContentId> {
        let first = match &self.roots {
            Some(roots) => roots.first(),
            None => self.base.roots.first(),
        };
        first.map(|root| root.content_id.clone())
    }

    pub(crate) fn child_count(&self, parent: &ContentId) -> usize {
        self.list(parent).map_or(0, |list| list.len())
    }

    pub(crate) fn position_of(&self, parent: &ContentId, id: &ContentId) -> Option<usize> {
        self.list(parent)?
            .iter()
            .position(|child| &child.content_id == id)
    }

    /// Adds a single node at `position` in its parent's child order.
    pub(crate) fn insert_at(&mut self, op: StructureOp, position: usize) -> Result<Arc<ModelChild>> {
        self.add(op, Some(position))
    }

    fn list_mut(&mut self, parent: Option<&ContentId>) -> &mut ThinVec<Arc<ModelChild>> {
        let base = self.base;
        match parent {
            None => self
                .roots
                .get_or_insert_with(|| ThinVec::clone(&base.roots)),
            Some(parent) => self
                .children
                .entry(parent.clone())
                .or_insert_with(|| base.children.get(parent).map(|list| ThinVec::clone(list)))
                .get_or_insert_with(ThinVec::new),
        }
    }

    fn begin_splice(&mut self, token_id: &ContentId) -> Result<()> {
        let token = self
            .node(token_id)
            .ok_or_else(|| FeedError::MissingTarget(token_id.clone()))?;
        if !token.is_token() {
            return Err(FeedError::NotAToken(token_id.clone()));
        }
        let parent_id = token
            .parent_id
            .clone()
            .ok_or_else(|| FeedError::TokenRoot(token_id.clone()))?;

        let list = self.list_mut(Some(&parent_id));
        let position = list
            .iter()
            .rposition(|child| &child.content_id == token_id)
            .ok_or_else(|| FeedError::MissingTarget(token_id.clone()))?;
        list.remove(position);
        self.nodes.insert(token_id.clone(), None);

        self.splice_cursor = Some(SpliceCursor {
            parent_id: parent_id.clone(),
            start: position,
            next: position,
        });
        self.applied.splice = Some(Splice {
            token,
            parent_id,
            position,
        });
        Ok(())
    }

    /// Closes the splice and records where the spliced children start.
    fn end_splice(&mut self) {
        let Some(cursor) = self.splice_cursor.take() else {
            return;
        };
        if let Some(splice) = self.applied.splice.as_mut() {
            splice.position = cursor.start;
        }
    }

    fn shift_splice_cursor(&mut self, parent: Option<&ContentId>, removed_index: usize) {
        let Some(cursor) = self.splice_cursor.as_mut() else {
            return;
        };
        if Some(&cursor.parent_id) != parent || removed_index >= cursor.next {
            return;
        }
        cursor.next -= 1;
        if removed_index < cursor.start {
            cursor.start -= 1;
        }
    }

    pub(crate) fn apply_op(&mut self, op: StructureOp) -> Result<()> {
        match op.kind {
            OpKind::Add => self.add(op, None).map(|_| ()),
            OpKind::Remove => self.remove(op),
            OpKind::Update => self.update(op),
        }
    }

    fn next_splice_position(&mut self, parent: Option<&ContentId>) -> Option<usize> {
        let cursor = self.splice_cursor.as_mut()?;
        if Some(&cursor.parent_id) != parent {
            return None;
        }
        let position = cursor.next;
        cursor.next += 1;
        Some(position)
    }

    fn add(&mut self, op: StructureOp, at: Option<usize>) -> Result<Arc<ModelChild>> {
        let StructureOp {
            content_id,
            parent_id,
            payload,
            is_synthetic,
            ..
        } = op;

        if self.node(&content_id).is_some() {
            return Err(FeedError::DuplicateContentId(content_id));
        }
        let payload = payload.ok_or_else(|| FeedError::MissingPayload(content_id.clone()))?;
        let kind = payload.kind();

        match &parent_id {
            None if kind == NodeKind::Token => {
                return Err(FeedError::TokenRoot(content_id));
            }
            None => {}
            Some(parent) => {
                let parent_node = self.node(parent).ok_or_else(|| FeedError::MissingParent {
                    content_id: content_id.clone(),
                    parent: parent.clone(),
                })?;
                if parent_node.is_token() {
                    return Err(FeedError::ParentIsToken {
                        content_id,
                        parent: parent.clone(),
                    });
                }
            }
        }

        let child = Arc::new(ModelChild {
            content_id: content_id.clone(),
            parent_id,
            kind,
            payload: self.interner.intern(payload),
            is_synthetic,
        });

        let position = at.or_else(|| self.next_splice_position(child.parent_id.as_ref()));
        let list = self.list_mut(child.parent_id.as_ref());
        match position {
            Some(index) => {
                let index = index.min(list.len());
                list.insert(index, child.clone());
            }
            None => list.push(child.clone()),
        }
        self.nodes.insert(content_id, Some(child.clone()));
        self.applied.added.push(child.clone());
        Ok(child)
    }

    fn remove(&mut self, op: StructureOp) -> Result<()> {
        let target = self
            .node(&op.content_id)
            .ok_or_else(|| FeedError::MissingTarget(op.content_id.clone()))?;
        if op.parent_id.is_some() && op.parent_id != target.parent_id {
            return Err(FeedError::MissingTarget(op.content_id));
        }

        // Tokens usually sit at the end of the list, so scan from the back.
        let list = self.list_mut(target.parent_id.as_ref());
        if let Some(index) = list
            .iter()
            .rposition(|child| child.content_id == op.content_id)
        {
            list.remove(index);
            self.shift_splice_cursor(target.parent_id.as_ref(), index);
        }

        let mut stack = vec![target];
        while let Some(node) = stack.pop() {
            let children = self.children_of(&node.content_id);
            stack.extend(children.into_iter().rev());
            self.nodes.insert(node.content_id.clone(), None);
            self.children.insert(node.content_id.clone(), None);
            self.applied.removed.push(node);
        }
        Ok(())
    }

    fn update(&mut self, op: StructureOp) -> Result<()> {
        let existing = self
            .node(&op.content_id)
            .ok_or_else(|| FeedError::MissingTarget(op.content_id.clone()))?;
        let payload = op
            .payload
            .ok_or_else(|| FeedError::MissingPayload(op.content_id.clone()))?;
        if payload.kind() != existing.kind {
            return Err(FeedError::KindMismatch {
                content_id: op.content_id,
                existing: existing.kind,
                incoming: payload.kind(),
            });
        }

        let updated = Arc::new(ModelChild {
            payload: self.interner.intern(payload),
            ..ModelChild::clone(&existing)
        });
        let list = self.list_mut(updated.parent_id.as_ref());
        if let Some(index) = list
            .iter()
            .rposition(|child| child.content_id == op.content_id)
        {
            list[index] = updated.clone();
        }
        self.nodes.insert(op.content_id, Some(updated.clone()));
        self.applied.updated.push(updated);
        Ok(())
    }

    /// Drops intra-batch churn: nodes added then removed in the same batch
    /// were never visible and are reported neither as added nor as removed.
    /// An installed node is reported removed at most once.
    fn into_changes(self) -> StagedChanges {
        let Staging {
            base,
            nodes,
            children,
            roots,
            mut applied,
            ..
        } = self;

        let survives = |child: &Arc<ModelChild>| {
            matches!(nodes.get(&child.content_id), Some(Some(current)) if Arc::ptr_eq(current, child))
        };
        applied.added.retain(|child| survives(child));
        applied.updated.retain(|child| survives(child));
        let mut reported = FnvHashSet::default();
        applied.removed.retain(|child| {
            base.nodes.contains_key(&child.content_id) && reported.insert(child.content_id.clone())
        });

        StagedChanges {
            nodes,
            children,
            roots,
            applied,
        }
    }
}

impl StagedChanges {
    fn install(self, state: &mut TreeState) -> AppliedBatch {
        for (id, node) in self.nodes {
            match node {
                Some(node) => {
                    state.nodes.insert(id, node);
                }
                None => {
                    state.nodes.remove(&id);
                }
            }
        }
        for (id, list) in self.children {
            match list {
                Some(list) if !list.is_empty() => {
                    state.children.insert(id, Arc::new(list));
                }
                _ => {
                    state.children.remove(&id);
                }
            }
        }
        if let Some(roots) = self.roots {
            state.roots = Arc::new(roots);
        }
        self.applied
    }
}

/// The in-memory feed tree: a forest of FEATURE and TOKEN nodes.
pub struct ContentTreeStore {
    writer: Mutex<()>,
    state: RwLock<TreeState>,
    interner: Arc<Interner<Payload>>,
    shared_states: InternedMap<ContentId, Payload>,
}

impl std::fmt::Debug for ContentTreeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentTreeStore")
            .field("len", &self.len())
            .field("interned", &self.interner.size())
            .finish()
    }
}

impl Default for ContentTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentTreeStore {
    pub fn new() -> Self {
        let interner = Arc::new(Interner::new());
        Self {
            writer: Mutex::new(()),
            state: RwLock::new(TreeState::default()),
            shared_states: InternedMap::new(interner.clone()),
            interner,
        }
    }

    /// Validates and applies `batch` as one unit.
    ///
    /// When `context` names a continuation token, that token is removed first
    /// and ADDs under its parent fill its former position in order.
    pub fn apply(&self, batch: Vec<StructureOp>, context: &MutationContext) -> Result<AppliedBatch> {
        self.apply_then(batch, context, |_| Ok(()))
    }

    /// Like `apply`, with `finish` run against the staged tree after the
    /// batch. Whatever `finish` stages is installed together with the batch.
    pub(crate) fn apply_then<F>(
        &self,
        batch: Vec<StructureOp>,
        context: &MutationContext,
        finish: F,
    ) -> Result<AppliedBatch>
    where
        F: FnOnce(&mut Staging<'_>) -> Result<()>,
    {
        let op_count = batch.len();
        let applied = self.transact(|staging| {
            if let Some(token_id) = &context.continuation_token {
                staging.begin_splice(token_id)?;
            }
            batch.into_iter().try_for_each(|op| staging.apply_op(op))?;
            staging.end_splice();
            finish(staging)
        })?;
        log::debug!(
            "content tree apply ops={} added={} updated={} removed={} spliced={}",
            op_count,
            applied.added.len(),
            applied.updated.len(),
            applied.removed.len(),
            applied.splice.is_some(),
        );
        Ok(applied)
    }

    fn transact<F>(&self, stage: F) -> Result<AppliedBatch>
    where
        F: FnOnce(&mut Staging<'_>) -> Result<()>,
    {
        let _writer = self.writer.lock();
        let changes = {
            let state = self.state.read();
            let mut staging = Staging::new(&state, &self.interner);
            stage(&mut staging)?;
            staging.into_changes()
        };
        let mut state = self.state.write();
        Ok(changes.install(&mut state))
    }

    pub fn get_node(&self, content_id: &str) -> Option<Node> {
        let state = self.state.read();
        let child = state.nodes.get(content_id)?;
        let child_ids = state
            .children
            .get(content_id)
            .map(|list| list.iter().map(|c| c.content_id.clone()).collect())
            .unwrap_or_default();
        Some(Node {
            content_id: child.content_id.clone(),
            parent_id: child.parent_id.clone(),
            child_ids,
            payload: child.payload.clone(),
            kind: child.kind,
            is_synthetic: child.is_synthetic,
        })
    }

    pub fn model_child(&self, content_id: &str) -> Option<Arc<ModelChild>> {
        self.state.read().nodes.get(content_id).cloned()
    }

    pub fn contains(&self, content_id: &str) -> bool {
        self.state.read().nodes.contains_key(content_id)
    }

    /// Cursor over the children of `parent_id` as installed right now.
    ///
    /// Unknown or childless parents yield an empty cursor.
    pub fn get_cursor(&self, parent_id: &str) -> Cursor {
        let parent = ContentId::new(parent_id);
        match self.state.read().children.get(parent_id).cloned() {
            Some(children) => Cursor::new(Some(parent), children),
            None => {
                log::debug!("no children found for cursor parent={}", parent_id);
                Cursor::empty(Some(parent))
            }
        }
    }

    /// Cursor over the root nodes.
    pub fn root_cursor(&self) -> Cursor {
        Cursor::new(None, self.state.read().roots.clone())
    }

    /// The child-order list of `parent_id` as installed right now.
    pub(crate) fn child_snapshot(&self, parent_id: Option<&ContentId>) -> ChildList {
        self.state
            .read()
            .child_list(parent_id)
            .unwrap_or_default()
    }

    pub fn root_ids(&self) -> Vec<ContentId> {
        self.state
            .read()
            .roots
            .iter()
            .map(|root| root.content_id.clone())
            .collect()
    }

    pub fn child_count(&self, parent_id: &str) -> usize {
        self.state
            .read()
            .children
            .get(parent_id)
            .map_or(0, |list| list.len())
    }

    pub fn position_of(&self, parent_id: &str, content_id: &str) -> Option<usize> {
        self.state
            .read()
            .children
            .get(parent_id)?
            .iter()
            .position(|child| child.content_id.as_str() == content_id)
    }

    /// Walks up from `content_id` to the child of a root that contains it.
    pub fn root_child_ancestor(&self, content_id: &str) -> Option<ContentId> {
        let state = self.state.read();
        let mut current = state.nodes.get(content_id)?;
        loop {
            let parent_id = current.parent_id.as_ref()?;
            let parent = state.nodes.get(parent_id)?;
            if parent.parent_id.is_none() {
                return Some(current.content_id.clone());
            }
            current = parent;
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every node and shared state in one step. The payload pool survives.
    pub fn clear(&self) {
        let _writer = self.writer.lock();
        *self.state.write() = TreeState::default();
        self.shared_states.clear();
    }

    pub fn interner(&self) -> &Arc<Interner<Payload>> {
        &self.interner
    }

    pub fn put_shared_state(&self, content_id: ContentId, payload: Payload) -> Option<Arc<Payload>> {
        let _writer = self.writer.lock();
        self.shared_states.put(content_id, payload)
    }

    pub fn shared_state(&self, content_id: &str) -> Option<Arc<Payload>> {
        self.shared_states.get(content_id)
    }
}
