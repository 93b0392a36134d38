#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use signbridge_lib::{
    engine::{
        Completion, ConnectionState, Engine, EngineEvent, IceCandidate, MediaConstraints,
        MediaTrack, PeerEngine, SessionDescription, StatsSnapshot, TrackKind,
    },
    media::{CameraFacing, CaptureDevices},
    session::{CallSession, SessionState},
    store::MessageFeed,
};
use tokio::{sync::mpsc, time::sleep};

#[derive(Default)]
pub struct FakeState {
    pub local: Vec<SessionDescription>,
    pub remote: Vec<SessionDescription>,
    pub applied: Vec<IceCandidate>,
    pub tracks: Vec<MediaTrack>,
    pub close_count: usize,
    /// Candidate strings the engine refuses.
    pub refused: Vec<String>,
    /// Keep `create_offer` completions instead of resolving them.
    pub hold_offers: bool,
    pub held: Vec<Completion<SessionDescription>>,
    /// Resolve every operation a second time with a failure.
    pub double_resolve: bool,
}

/// Scripted engine: SDP must start with `v=0`, everything else succeeds.
pub struct FakeEngine {
    name: String,
    state: Mutex<FakeState>,
    events: mpsc::Sender<EngineEvent>,
}

impl FakeEngine {
    pub fn new(name: &str) -> (Arc<FakeEngine>, Engine) {
        let (tx, rx) = mpsc::channel(64);
        let fake = Arc::new(FakeEngine {
            name: name.to_owned(),
            state: Mutex::new(FakeState::default()),
            events: tx,
        });
        (fake.clone(), Engine::new(fake, rx))
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn emit(&self, event: EngineEvent) {
        self.events.try_send(event).unwrap();
    }

    /// The session stopped listening to this engine.
    pub fn events_closed(&self) -> bool {
        self.events.is_closed()
    }

    fn resolve<T: Clone>(&self, done: &Completion<T>, result: Result<T, String>) {
        let double = self.state().double_resolve;
        done.complete(result.clone());
        if double {
            done.complete(Err("resolved twice".to_owned()));
        }
    }

    fn check_sdp(desc: &SessionDescription) -> Result<(), String> {
        if desc.sdp().starts_with("v=0") {
            Ok(())
        } else {
            Err(format!("malformed sdp: {:?}", desc.sdp()))
        }
    }

    fn both_descriptions_set(&self) {
        let connected = {
            let state = self.state();
            !state.local.is_empty() && !state.remote.is_empty()
        };
        if connected {
            let _ = self
                .events
                .try_send(EngineEvent::ConnectionState(ConnectionState::Connected));
        }
    }
}

impl PeerEngine for FakeEngine {
    fn create_offer(&self, _constraints: &MediaConstraints, done: Completion<SessionDescription>) {
        let mut state = self.state();
        if state.hold_offers {
            state.held.push(done);
            return;
        }
        drop(state);
        let offer = SessionDescription::offer(format!("v=0 offer from {} vp8", self.name));
        self.resolve(&done, Ok(offer));
    }

    fn create_answer(&self, _constraints: &MediaConstraints, done: Completion<SessionDescription>) {
        let answer = SessionDescription::answer(format!("v=0 answer from {} vp8", self.name));
        self.resolve(&done, Ok(answer));
    }

    fn set_local_description(&self, desc: SessionDescription, done: Completion<()>) {
        let result = Self::check_sdp(&desc);
        if result.is_ok() {
            self.state().local.push(desc);
        }
        self.resolve(&done, result);
        self.both_descriptions_set();
    }

    fn set_remote_description(&self, desc: SessionDescription, done: Completion<()>) {
        let result = Self::check_sdp(&desc);
        if result.is_ok() {
            self.state().remote.push(desc);
        }
        self.resolve(&done, result);
        self.both_descriptions_set();
    }

    fn add_ice_candidate(&self, candidate: IceCandidate, done: Completion<()>) {
        let result = {
            let mut state = self.state();
            if state.refused.contains(&candidate.candidate) {
                Err("unknown ufrag".to_owned())
            } else {
                state.applied.push(candidate);
                Ok(())
            }
        };
        self.resolve(&done, result);
    }

    fn add_track(&self, track: MediaTrack, done: Completion<()>) {
        self.state().tracks.push(track);
        self.resolve(&done, Ok(()));
    }

    fn stats(&self, done: Completion<StatsSnapshot>) {
        let entries = self.state().applied.len();
        self.resolve(
            &done,
            Ok(StatsSnapshot {
                collected_at: chrono::Utc::now(),
                entries,
            }),
        );
    }

    fn close(&self) {
        self.state().close_count += 1;
    }
}

#[derive(Default)]
pub struct DeviceLog {
    pub starts: usize,
    pub stops: usize,
    pub microphone: Vec<bool>,
    pub camera: Vec<bool>,
    pub facing: Vec<CameraFacing>,
    pub fail_start: bool,
    pub stop_delay: Option<Duration>,
}

/// Capture devices that record every call into a shared log.
pub struct RecordingDevices(pub Arc<Mutex<DeviceLog>>);

impl RecordingDevices {
    pub fn new() -> (Arc<Mutex<DeviceLog>>, Box<dyn CaptureDevices>) {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        (log.clone(), Box::new(RecordingDevices(log)))
    }
}

#[async_trait]
impl CaptureDevices for RecordingDevices {
    async fn start(&mut self) -> Result<Vec<MediaTrack>> {
        let mut log = self.0.lock().unwrap();
        if log.fail_start {
            bail!("camera is busy");
        }
        log.starts += 1;
        drop(log);
        Ok(vec![
            MediaTrack::local(TrackKind::Audio),
            MediaTrack::local(TrackKind::Video),
        ])
    }

    async fn set_microphone_enabled(&mut self, enabled: bool) -> Result<()> {
        self.0.lock().unwrap().microphone.push(enabled);
        Ok(())
    }

    async fn set_camera_enabled(&mut self, enabled: bool) -> Result<()> {
        self.0.lock().unwrap().camera.push(enabled);
        Ok(())
    }

    async fn flip_camera(&mut self, facing: CameraFacing) -> Result<()> {
        self.0.lock().unwrap().facing.push(facing);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let delay = self.0.lock().unwrap().stop_delay;
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        self.0.lock().unwrap().stops += 1;
        Ok(())
    }
}

pub fn candidate(n: u16) -> IceCandidate {
    IceCandidate::new(
        "0".to_owned(),
        0,
        format!("candidate:{} 1 udp 2122260223 192.0.2.{} 5000{} typ host", n, n, n),
    )
}

pub fn document(kind: &str, payload: &str, sender: &str) -> Value {
    json!({ "type": kind, "sdpDescription": payload, "sender": sender })
}

/// Number of `kind` documents sent by `sender` on the call's feed.
pub async fn count_sent(feed: &dyn MessageFeed, call_id: &str, kind: &str, sender: &str) -> usize {
    feed.fetch(call_id)
        .await
        .unwrap()
        .iter()
        .filter(|doc| doc.body["type"] == kind && doc.body["sender"] == sender)
        .count()
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

pub async fn wait_for_state(session: &CallSession, expected: SessionState) {
    let mut state = session.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *state.borrow_and_update() == expected {
                return;
            }
            state.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {:?}, still {:?}", expected, session.state()));
}
