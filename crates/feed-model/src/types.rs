//! Core value types shared by the store, the mutation path and the trackers.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Opaque identifier of a node, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(Arc<str>);

impl ContentId {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(Arc::from(value.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ContentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContentId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Node kind: real content or a pagination placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Feature,
    Token,
}

/// Renderable content carried by a FEATURE node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Feature {
    /// Article url, when the feature links to one (drives offline badges).
    pub url: Option<String>,
    pub content: Vec<u8>,
}

/// Continuation marker carried by a TOKEN node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamToken {
    pub next_page_token: Vec<u8>,
}

/// Immutable node payload. Equal payloads are interned to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Payload {
    Feature(Feature),
    Token(StreamToken),
}

impl Payload {
    pub fn feature(content: impl Into<Vec<u8>>) -> Self {
        Self::Feature(Feature {
            url: None,
            content: content.into(),
        })
    }

    pub fn feature_with_url(url: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::Feature(Feature {
            url: Some(url.into()),
            content: content.into(),
        })
    }

    pub fn token(next_page_token: impl Into<Vec<u8>>) -> Self {
        Self::Token(StreamToken {
            next_page_token: next_page_token.into(),
        })
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Feature(_) => NodeKind::Feature,
            Self::Token(_) => NodeKind::Token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Add,
    Remove,
    Update,
}

/// One structural operation of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureOp {
    pub kind: OpKind,
    pub content_id: ContentId,
    pub parent_id: Option<ContentId>,
    pub payload: Option<Payload>,
    pub is_synthetic: bool,
}

impl StructureOp {
    /// Appends `content_id` under `parent_id`, or adds a root when `parent_id` is `None`.
    pub fn add(
        content_id: impl Into<ContentId>,
        parent_id: Option<ContentId>,
        payload: Payload,
    ) -> Self {
        Self {
            kind: OpKind::Add,
            content_id: content_id.into(),
            parent_id,
            payload: Some(payload),
            is_synthetic: false,
        }
    }

    pub fn add_child(
        parent_id: impl Into<ContentId>,
        content_id: impl Into<ContentId>,
        payload: Payload,
    ) -> Self {
        Self::add(content_id, Some(parent_id.into()), payload)
    }

    pub fn remove(content_id: impl Into<ContentId>, parent_id: Option<ContentId>) -> Self {
        Self {
            kind: OpKind::Remove,
            content_id: content_id.into(),
            parent_id,
            payload: None,
            is_synthetic: false,
        }
    }

    pub fn update(content_id: impl Into<ContentId>, payload: Payload) -> Self {
        Self {
            kind: OpKind::Update,
            content_id: content_id.into(),
            parent_id: None,
            payload: Some(payload),
            is_synthetic: false,
        }
    }

    pub fn synthetic(mut self) -> Self {
        self.is_synthetic = true;
        self
    }
}

/// Metadata attached to a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationContext {
    pub session_id: Option<String>,
    /// Token whose continuation response this commit carries.
    pub continuation_token: Option<ContentId>,
    pub cached_bindings: bool,
}

impl MutationContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn for_continuation(token_id: impl Into<ContentId>) -> Self {
        Self {
            continuation_token: Some(token_id.into()),
            ..Self::default()
        }
    }
}

/// A node as stored in a child-order list. Cursors hand these out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChild {
    pub content_id: ContentId,
    pub parent_id: Option<ContentId>,
    pub kind: NodeKind,
    pub payload: Arc<Payload>,
    pub is_synthetic: bool,
}

impl ModelChild {
    #[inline]
    pub fn is_token(&self) -> bool {
        self.kind == NodeKind::Token
    }

    pub fn feature(&self) -> Option<&Feature> {
        match self.payload.as_ref() {
            Payload::Feature(feature) => Some(feature),
            Payload::Token(_) => None,
        }
    }

    pub fn token(&self) -> Option<&StreamToken> {
        match self.payload.as_ref() {
            Payload::Token(token) => Some(token),
            Payload::Feature(_) => None,
        }
    }
}

/// Point-read view of a node, including its ordered child ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub content_id: ContentId,
    pub parent_id: Option<ContentId>,
    pub child_ids: Vec<ContentId>,
    pub payload: Arc<Payload>,
    pub kind: NodeKind,
    pub is_synthetic: bool,
}
