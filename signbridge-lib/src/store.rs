mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::call::{Call, CallId, CallUpdate};

/// One stored document of a call's message feed.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FeedDocument {
    /// Position in the feed, starting at 1 and strictly increasing.
    pub seq: u64,
    pub body: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FeedChange {
    pub kind: ChangeKind,
    pub document: FeedDocument,
}

/// Append-only document feeds, one per call.
#[async_trait]
pub trait MessageFeed: Send + Sync + 'static {
    async fn append(&self, call_id: &str, body: Value) -> Result<u64>;
    async fn fetch(&self, call_id: &str) -> Result<Vec<FeedDocument>>;
    /// Changes made after this call returns. The listener is released when the receiver is
    /// dropped. An `Err` item is a transient failure; the stream goes on.
    async fn listen(&self, call_id: &str)
        -> Result<mpsc::UnboundedReceiver<Result<FeedChange>>>;
}

#[async_trait]
pub trait CallRecords: Send + Sync + 'static {
    async fn create_call(&self, call: Call) -> Result<CallId>;
    /// Returns `false` if the call does not exist.
    async fn update_call(&self, call_id: &str, update: CallUpdate) -> Result<bool>;
    /// Returns `false` if the call does not exist.
    async fn delete_call(&self, call_id: &str) -> Result<bool>;
    async fn find_call(&self, call_id: &str) -> Result<Option<Call>>;
    /// Pending calls addressed to `user_id`, each reported once.
    async fn incoming_calls_for(&self, user_id: &str) -> Result<mpsc::UnboundedReceiver<Call>>;
}

pub trait Store: MessageFeed + CallRecords {}
