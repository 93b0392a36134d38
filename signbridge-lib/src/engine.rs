pub mod completion;
pub mod rtc;

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use derive_new::new;
use getset::{CopyGetters, Getters};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use self::completion::{single_shot, Completion, Pending};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters, new)]
pub struct SessionDescription {
    #[get_copy = "pub"]
    kind: SdpKind,
    #[get = "pub"]
    sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Offer, sdp.into())
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Answer, sdp.into())
    }

    pub fn into_sdp(self) -> String {
        self.sdp
    }
}

/// A connectivity hint relayed verbatim between the peers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, new)]
pub struct IceCandidate {
    pub mid: String,
    pub m_line_index: u16,
    pub candidate: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    fn id_prefix(self) -> &'static str {
        match self {
            Self::Audio => "Audio",
            Self::Video => "Video",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, new)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn local(kind: TrackKind) -> Self {
        Self::new(format!("{}{}", kind.id_prefix(), Uuid::new_v4()), kind)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatsSnapshot {
    pub collected_at: DateTime<Utc>,
    pub entries: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    IceCandidate(IceCandidate),
    RemoteTrack(MediaTrack),
    ConnectionState(ConnectionState),
}

/// The transport engine boundary.
///
/// Every operation reports its outcome through the given [`Completion`], possibly
/// from another task and possibly more than once; only the first report counts.
pub trait PeerEngine: Send + Sync + 'static {
    fn create_offer(&self, constraints: &MediaConstraints, done: Completion<SessionDescription>);
    fn create_answer(&self, constraints: &MediaConstraints, done: Completion<SessionDescription>);
    fn set_local_description(&self, desc: SessionDescription, done: Completion<()>);
    fn set_remote_description(&self, desc: SessionDescription, done: Completion<()>);
    fn add_ice_candidate(&self, candidate: IceCandidate, done: Completion<()>);
    fn add_track(&self, track: MediaTrack, done: Completion<()>);
    fn stats(&self, done: Completion<StatsSnapshot>);
    fn close(&self);
}

/// One engine connection together with the events it emits.
pub struct Engine {
    pub connection: Arc<dyn PeerEngine>,
    pub events: mpsc::Receiver<EngineEvent>,
}

impl Engine {
    pub fn new(connection: Arc<dyn PeerEngine>, events: mpsc::Receiver<EngineEvent>) -> Self {
        Self { connection, events }
    }
}
