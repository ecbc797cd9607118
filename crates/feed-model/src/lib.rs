//! In-memory feed content model.
//!
//! This crate provides the core of a paginated content feed:
//! - A content tree with atomic batch commits and snapshot cursors
//! - Continuation tokens, network and synthetic, spliced in place on completion
//! - Payload interning across paginated fetches
//! - Removal tracking and offline availability caching
//! - Observer registries with notifications dispatched off the commit lock

pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod interner;
pub mod model;
pub mod mutation;
pub mod offline;
pub mod paging;
pub mod removal;
pub mod session;
pub mod store;
pub mod subscription;
pub mod tokens;
pub mod types;

// Re-export main types
pub use config::FeedConfig;
pub use cursor::Cursor;
pub use dispatch::{InlineRunner, QueueRunner, Task, TaskQueue, TaskRunner};
pub use error::{FeedError, HostError, ModelError, ModelErrorKind, Result};
pub use interner::{InternedMap, Interner};
pub use model::{FeedModel, FeedObserver, FilterPredicate, ModelState, ModelStats, TokenHandler};
pub use mutation::{Change, CommitOutcome, CommitSummary, Committer, MutationBuilder};
pub use offline::{OfflineAvailabilityTracker, OfflineStatusHost, OfflineStatusObserver};
pub use removal::{RemovalTracker, RemoveTracking, RemoveTrackingFactory};
pub use session::FeedSession;
pub use store::{AppliedBatch, ContentTreeStore, Splice};
pub use subscription::{Subscription, SubscriptionId, SubscriptionRegistry};
pub use tokens::{TokenCompleted, TokenCompletedObserver, TokenEntry, TokenRegistry};
pub use types::{
    ContentId, Feature, ModelChild, MutationContext, Node, NodeKind, OpKind, Payload,
    StreamToken, StructureOp,
};
