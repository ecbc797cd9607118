//! Building and committing a batch of structure changes.

use std::sync::Arc;

use crate::error::Result;
use crate::types::{ContentId, MutationContext, Payload, StructureOp};

/// One batch plus its metadata, as handed to a `Committer`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Change {
    pub structure_ops: Vec<StructureOp>,
    pub context: MutationContext,
}

/// What a successful commit did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied(CommitSummary),
    /// The commit answered a token that is no longer pending. Nothing changed.
    StaleContinuation(ContentId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub completed_token: Option<ContentId>,
    pub synthetic_token: Option<ContentId>,
    pub cached_bindings: bool,
}

impl CommitOutcome {
    pub fn summary(&self) -> Option<&CommitSummary> {
        match self {
            Self::Applied(summary) => Some(summary),
            Self::StaleContinuation(_) => None,
        }
    }
}

pub trait Committer: Send + Sync {
    fn commit(&self, change: Change) -> Result<CommitOutcome>;
}

/// Accumulates structure ops for a single commit.
///
/// Every call consumes and returns the builder; `commit` consumes it for
/// good, so a builder cannot be committed twice.
pub struct MutationBuilder {
    committer: Arc<dyn Committer>,
    change: Change,
}

impl std::fmt::Debug for MutationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationBuilder")
            .field("change", &self.change)
            .finish_non_exhaustive()
    }
}

impl MutationBuilder {
    pub fn new(committer: Arc<dyn Committer>) -> Self {
        Self {
            committer,
            change: Change::default(),
        }
    }

    /// Appends `content_id` to `parent_id`'s children; `None` adds a root.
    pub fn add_child(
        mut self,
        content_id: impl Into<ContentId>,
        parent_id: Option<ContentId>,
        payload: Payload,
    ) -> Self {
        self.change
            .structure_ops
            .push(StructureOp::add(content_id, parent_id, payload));
        self
    }

    pub fn remove_child(
        mut self,
        content_id: impl Into<ContentId>,
        parent_id: Option<ContentId>,
    ) -> Self {
        self.change
            .structure_ops
            .push(StructureOp::remove(content_id, parent_id));
        self
    }

    pub fn update_child(mut self, content_id: impl Into<ContentId>, payload: Payload) -> Self {
        self.change
            .structure_ops
            .push(StructureOp::update(content_id, payload));
        self
    }

    /// Appends an already built op, e.g. one decoded from a response.
    pub fn add_structure(mut self, op: StructureOp) -> Self {
        self.change.structure_ops.push(op);
        self
    }

    /// Replaces the context. A session id set earlier survives when the new
    /// context carries none.
    pub fn set_mutation_context(mut self, context: MutationContext) -> Self {
        let session_id = self.change.context.session_id.take();
        self.change.context = context;
        if self.change.context.session_id.is_none() {
            self.change.context.session_id = session_id;
        }
        self
    }

    pub fn set_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.change.context.session_id = Some(session_id.into());
        self
    }

    pub fn has_cached_bindings(mut self, cached_bindings: bool) -> Self {
        self.change.context.cached_bindings = cached_bindings;
        self
    }

    pub fn len(&self) -> usize {
        self.change.structure_ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change.structure_ops.is_empty()
    }

    pub fn commit(self) -> Result<CommitOutcome> {
        let MutationBuilder { committer, change } = self;
        committer.commit(change)
    }
}
