use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{spawn, sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, trace, warn};

use crate::{
    engine::IceCandidate,
    error::{ChannelError, MalformedMessage},
    session::Role,
    store::{ChangeKind, FeedDocument, MessageFeed},
};

const ICE_SEPARATOR: char = '$';
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MessageKind {
    #[serde(rename = "OFFER")]
    Offer,
    #[serde(rename = "ANSWER")]
    Answer,
    #[serde(rename = "ICE")]
    IceCandidate,
    #[serde(rename = "STATE")]
    SessionState,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SignalingMessage {
    pub kind: MessageKind,
    pub payload: String,
}

impl SignalingMessage {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Offer,
            payload: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Answer,
            payload: sdp.into(),
        }
    }

    pub fn ice_candidate(candidate: &IceCandidate) -> Self {
        Self {
            kind: MessageKind::IceCandidate,
            payload: format!(
                "{}{sep}{}{sep}{}",
                candidate.mid,
                candidate.m_line_index,
                candidate.candidate,
                sep = ICE_SEPARATOR
            ),
        }
    }

    pub fn session_state(state: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::SessionState,
            payload: state.into(),
        }
    }

    /// Decodes the `mid$mLineIndex$candidate` tuple of an ICE message.
    pub fn to_ice_candidate(&self) -> Result<IceCandidate, MalformedMessage> {
        if self.kind != MessageKind::IceCandidate {
            return Err(MalformedMessage(format!(
                "{:?} message is not a candidate",
                self.kind
            )));
        }
        let mut parts = self.payload.splitn(3, ICE_SEPARATOR);
        let (Some(mid), Some(m_line_index), Some(candidate)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(MalformedMessage(format!(
                "candidate tuple has too few fields: {:?}",
                self.payload
            )));
        };
        let m_line_index = m_line_index.parse().map_err(|_| {
            MalformedMessage(format!("invalid m-line index: {:?}", m_line_index))
        })?;
        Ok(IceCandidate::new(
            mid.to_owned(),
            m_line_index,
            candidate.to_owned(),
        ))
    }
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    #[serde(rename = "type")]
    kind: MessageKind,
    sdp_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<Role>,
}

fn encode(message: &SignalingMessage, sender: Role) -> serde_json::Result<Value> {
    serde_json::to_value(Document {
        kind: message.kind,
        sdp_description: message.payload.clone(),
        sender: Some(sender),
    })
}

fn decode(body: &Value) -> Result<(SignalingMessage, Option<Role>), MalformedMessage> {
    let document = Document::deserialize(body).map_err(|err| MalformedMessage(err.to_string()))?;
    let message = SignalingMessage {
        kind: document.kind,
        payload: document.sdp_description,
    };
    Ok((message, document.sender))
}

/// Counts signaling input that was dropped instead of delivered.
#[derive(Clone, Debug, Default)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn record(&self, reason: &dyn fmt::Display) {
        let total = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("signaling message dropped ({} so far): {}", total, reason);
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Typed negotiation messages for calls, multiplexed over a [`MessageFeed`].
#[derive(Clone)]
pub struct SignalingChannel {
    feed: Arc<dyn MessageFeed>,
    local_role: Role,
}

impl SignalingChannel {
    pub fn new(feed: Arc<dyn MessageFeed>, local_role: Role) -> Self {
        Self { feed, local_role }
    }

    pub async fn send(
        &self,
        call_id: &str,
        message: &SignalingMessage,
    ) -> Result<u64, ChannelError> {
        trace!("send {:?} to {}", message.kind, call_id);
        let body = encode(message, self.local_role)
            .map_err(|err| ChannelError::Append(err.into()))?;
        self.feed.append(call_id, body).await.map_err(|err| {
            warn!("failed to send {:?}: {:#}", message.kind, err);
            ChannelError::Append(err)
        })
    }

    /// Stored messages first, then new ones in feed order. Messages sent by the local role
    /// are skipped.
    pub fn subscribe(&self, call_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let drops = DropCounter::default();
        let task = spawn(pump(
            self.feed.clone(),
            call_id.to_owned(),
            self.local_role,
            tx,
            drops.clone(),
        ));
        Subscription { rx, task, drops }
    }
}

/// Returns `false` once the subscriber is gone.
fn deliver(
    document: FeedDocument,
    local_role: Role,
    tx: &mpsc::UnboundedSender<SignalingMessage>,
    drops: &DropCounter,
) -> bool {
    let (message, sender) = match decode(&document.body) {
        Ok(decoded) => decoded,
        Err(err) => {
            drops.record(&err);
            return !tx.is_closed();
        }
    };
    if sender == Some(local_role) {
        return !tx.is_closed();
    }
    trace!("received #{} {:?}", document.seq, message.kind);
    tx.send(message).is_ok()
}

async fn pump(
    feed: Arc<dyn MessageFeed>,
    call_id: String,
    local_role: Role,
    tx: mpsc::UnboundedSender<SignalingMessage>,
    drops: DropCounter,
) {
    let mut changes = loop {
        match feed.listen(&call_id).await {
            Ok(changes) => break changes,
            Err(err) => warn!("{:#}", ChannelError::Listen(err)),
        }
        sleep(RETRY_INTERVAL).await;
    };
    let existing = loop {
        match feed.fetch(&call_id).await {
            Ok(existing) => break existing,
            Err(err) => warn!("{:#}", ChannelError::Fetch(err)),
        }
        sleep(RETRY_INTERVAL).await;
    };

    let mut last_seq = 0;
    for document in existing {
        last_seq = last_seq.max(document.seq);
        if !deliver(document, local_role, &tx, &drops) {
            return;
        }
    }
    while let Some(change) = changes.recv().await {
        let change = match change {
            Ok(change) => change,
            Err(err) => {
                warn!("{:#}", ChannelError::Listen(err));
                continue;
            }
        };
        if change.kind != ChangeKind::Added || change.document.seq <= last_seq {
            continue;
        }
        last_seq = change.document.seq;
        if !deliver(change.document, local_role, &tx, &drops) {
            return;
        }
    }
    debug!("feed {} closed by the store", call_id);
}

/// A live stream of incoming messages for one call. Dropping it releases the listener.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    task: JoinHandle<()>,
    drops: DropCounter,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.task.abort();
        self.rx.close();
    }

    pub fn drops(&self) -> &DropCounter {
        &self.drops
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
