use crate::types::{ContentId, NodeKind};

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Malformed batch: parent {parent} of {content_id} does not exist")]
    MissingParent {
        content_id: ContentId,
        parent: ContentId,
    },

    #[error("Malformed batch: duplicate content id {0}")]
    DuplicateContentId(ContentId),

    #[error("Malformed batch: target {0} does not exist")]
    MissingTarget(ContentId),

    #[error("Malformed batch: {0} carries no payload")]
    MissingPayload(ContentId),

    #[error("Malformed batch: cannot change {content_id} from {existing:?} to {incoming:?}")]
    KindMismatch {
        content_id: ContentId,
        existing: NodeKind,
        incoming: NodeKind,
    },

    #[error("Malformed batch: token {0} cannot be a root")]
    TokenRoot(ContentId),

    #[error("Malformed batch: token {parent} cannot have child {content_id}")]
    ParentIsToken {
        content_id: ContentId,
        parent: ContentId,
    },

    #[error("Malformed batch: continuation {0} is not a token")]
    NotAToken(ContentId),

    #[error("Session mismatch: model is bound to {expected}, mutation carries {actual}")]
    SessionMismatch { expected: String, actual: String },

    #[error("Model has been invalidated")]
    Invalidated,

    #[error("Config error: {0}")]
    Config(String),
}

impl FeedError {
    /// Returns true for every rejection of a structurally invalid batch.
    pub fn is_malformed_batch(&self) -> bool {
        matches!(
            self,
            Self::MissingParent { .. }
                | Self::DuplicateContentId(_)
                | Self::MissingTarget(_)
                | Self::MissingPayload(_)
                | Self::KindMismatch { .. }
                | Self::TokenRoot(_)
                | Self::ParentIsToken { .. }
                | Self::NotAToken(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

/// Failure reported by a host collaborator (offline index, network layer).
///
/// The core never raises this itself; it only logs it and schedules a retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Host query failed: {0}")]
pub struct HostError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    /// The session produced no content at all.
    NoCards,
    /// Fetching the page behind a network token failed.
    Pagination,
    /// A synthetic token could not be located when handled.
    SyntheticToken,
}

/// Error delivered to observers. Never returned from a model call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} error: {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub token_id: Option<ContentId>,
    pub message: String,
}

impl ModelError {
    pub fn no_cards(message: impl Into<String>) -> Self {
        Self {
            kind: ModelErrorKind::NoCards,
            token_id: None,
            message: message.into(),
        }
    }

    pub fn pagination(token_id: impl Into<ContentId>, message: impl Into<String>) -> Self {
        Self {
            kind: ModelErrorKind::Pagination,
            token_id: Some(token_id.into()),
            message: message.into(),
        }
    }

    pub(crate) fn synthetic_token(token_id: ContentId) -> Self {
        Self {
            message: format!("synthetic token {token_id} not found"),
            kind: ModelErrorKind::SyntheticToken,
            token_id: Some(token_id),
        }
    }
}
