use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::call::{Call, CallId, CallUpdate};

use super::{CallRecords, ChangeKind, FeedChange, FeedDocument, MessageFeed, Store};

struct IncomingListener {
    user_id: String,
    reported: HashSet<CallId>,
    tx: mpsc::UnboundedSender<Call>,
}

impl IncomingListener {
    /// Returns `false` once the receiver is gone.
    fn offer(&mut self, call: &Call) -> bool {
        if !call.status().is_pending()
            || call.callee_id() != &self.user_id
            || self.reported.contains(call.id())
        {
            return !self.tx.is_closed();
        }
        self.reported.insert(call.id().clone());
        self.tx.send(call.clone()).is_ok()
    }
}

#[derive(Default)]
struct State {
    calls: HashMap<CallId, Call>,
    feeds: HashMap<CallId, Vec<FeedDocument>>,
    feed_listeners: HashMap<CallId, Vec<mpsc::UnboundedSender<Result<FeedChange>>>>,
    incoming_listeners: Vec<IncomingListener>,
}

impl State {
    fn notify_incoming(&mut self, call: &Call) {
        self.incoming_listeners
            .retain_mut(|listener| listener.offer(call));
    }
}

/// In-process store. Listeners are push based and see changes immediately.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageFeed for MemoryStore {
    async fn append(&self, call_id: &str, body: Value) -> Result<u64> {
        let mut state = self.state();
        let feed = state.feeds.entry(call_id.to_owned()).or_default();
        let document = FeedDocument {
            seq: feed.len() as u64 + 1,
            body,
        };
        feed.push(document.clone());
        let seq = document.seq;
        if let Some(listeners) = state.feed_listeners.get_mut(call_id) {
            listeners.retain(|tx| {
                tx.send(Ok(FeedChange {
                    kind: ChangeKind::Added,
                    document: document.clone(),
                }))
                .is_ok()
            });
        }
        trace!("appended #{} to feed {}", seq, call_id);
        Ok(seq)
    }

    async fn fetch(&self, call_id: &str) -> Result<Vec<FeedDocument>> {
        Ok(self.state().feeds.get(call_id).cloned().unwrap_or_default())
    }

    async fn listen(
        &self,
        call_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<Result<FeedChange>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state()
            .feed_listeners
            .entry(call_id.to_owned())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[async_trait]
impl CallRecords for MemoryStore {
    async fn create_call(&self, call: Call) -> Result<CallId> {
        let id = if call.id().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            call.id().clone()
        };
        let call = call.with_id(id.clone());
        let mut state = self.state();
        state.notify_incoming(&call);
        state.calls.insert(id.clone(), call);
        Ok(id)
    }

    async fn update_call(&self, call_id: &str, update: CallUpdate) -> Result<bool> {
        let mut state = self.state();
        let Some(call) = state.calls.get_mut(call_id) else {
            return Ok(false);
        };
        call.apply(&update);
        let call = call.clone();
        state.notify_incoming(&call);
        Ok(true)
    }

    async fn delete_call(&self, call_id: &str) -> Result<bool> {
        // NOTE: the feed outlives the record so the peer can still read the final messages.
        Ok(self.state().calls.remove(call_id).is_some())
    }

    async fn find_call(&self, call_id: &str) -> Result<Option<Call>> {
        Ok(self.state().calls.get(call_id).cloned())
    }

    async fn incoming_calls_for(&self, user_id: &str) -> Result<mpsc::UnboundedReceiver<Call>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listener = IncomingListener {
            user_id: user_id.to_owned(),
            reported: HashSet::new(),
            tx,
        };
        let mut state = self.state();
        let mut existing: Vec<_> = state.calls.values().cloned().collect();
        existing.sort_by_key(|call| call.timestamp());
        for call in &existing {
            listener.offer(call);
        }
        state.incoming_listeners.push(listener);
        Ok(rx)
    }
}

impl Store for MemoryStore {}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::call::{CallStatus, Participant};

    use super::*;

    fn call(callee: &str) -> Call {
        Call::new(
            &Participant::new("caller".into(), "Caller".into()),
            &Participant::new(callee.into(), callee.into()),
        )
    }

    #[tokio::test]
    async fn feed_numbers_documents_in_order() {
        let store = MemoryStore::new();
        let mut changes = store.listen("c1").await.unwrap();
        assert_eq!(store.append("c1", json!({"n": 1})).await.unwrap(), 1);
        assert_eq!(store.append("c1", json!({"n": 2})).await.unwrap(), 2);
        store.append("other", json!({"n": 3})).await.unwrap();

        let docs = store.fetch("c1").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].body, json!({"n": 2}));

        let first = changes.recv().await.unwrap().unwrap();
        assert_eq!(first.kind, ChangeKind::Added);
        assert_eq!(first.document.seq, 1);
        assert_eq!(changes.recv().await.unwrap().unwrap().document.seq, 2);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_listener_is_released() {
        let store = MemoryStore::new();
        drop(store.listen("c1").await.unwrap());
        store.append("c1", json!({})).await.unwrap();
        assert!(store.state().feed_listeners["c1"].is_empty());
    }

    #[tokio::test]
    async fn incoming_calls_are_reported_once() {
        let store = MemoryStore::new();
        let before = store.create_call(call("bob")).await.unwrap();
        store.create_call(call("carol")).await.unwrap();

        let mut incoming = store.incoming_calls_for("bob").await.unwrap();
        assert_eq!(incoming.recv().await.unwrap().id(), &before);

        let after = store.create_call(call("bob")).await.unwrap();
        assert_eq!(incoming.recv().await.unwrap().id(), &after);

        store
            .update_call(&after, CallUpdate::status(CallStatus::Ringing))
            .await
            .unwrap();
        assert!(incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_and_delete_missing_calls() {
        let store = MemoryStore::new();
        assert!(!store
            .update_call("nope", CallUpdate::status(CallStatus::Ended))
            .await
            .unwrap());
        assert!(!store.delete_call("nope").await.unwrap());

        let id = store.create_call(call("bob")).await.unwrap();
        assert!(store.delete_call(&id).await.unwrap());
        assert!(store.find_call(&id).await.unwrap().is_none());
    }
}
