//! Change feed consumption
//!
//! The database is reached through [`ChangeFeed`], which yields document
//! mutations in commit order. [`ChangeFeedConsumer`] layers subscription
//! filtering, resumption from the last [`CheckpointStore`] position and
//! bounded reconnects on top of it.

pub mod checkpoint;
pub mod consumer;
pub mod memory;

use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::BTreeSet;
use std::pin::Pin;

use crate::types::{ChangeEvent, Offset};
use crate::Result;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use consumer::ChangeFeedConsumer;
pub use memory::InMemoryChangeFeed;

/// Lazy, unbounded sequence of changes.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent>> + Send>>;

/// What a consumer subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
    pub collections: BTreeSet<String>,
    pub apply_to_all_documents: bool,
    /// Only events with an offset greater than this are delivered.
    pub from_checkpoint: Option<Offset>,
}

impl FeedRequest {
    pub fn matches(&self, collection: &str) -> bool {
        self.apply_to_all_documents || self.collections.contains(collection)
    }

    pub fn is_after_checkpoint(&self, offset: Offset) -> bool {
        self.from_checkpoint.map_or(true, |checkpoint| offset > checkpoint)
    }
}

/// Source of document mutations, implemented by the database integration.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a stream of changes ordered by commit order per collection.
    async fn open(&self, request: FeedRequest) -> Result<ChangeStream>;
}
