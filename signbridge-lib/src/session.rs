use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    spawn,
    sync::{self, mpsc, watch, OnceCell},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    call::CallId,
    config::Config,
    engine::{
        ConnectionState, Engine, EngineEvent, IceCandidate, MediaConstraints, MediaTrack,
        SessionDescription, StatsSnapshot,
    },
    error::{ClosedError, Error, Result},
    media::{CaptureDevices, MediaControls},
    negotiator::{NegotiationState, Negotiator},
    signaling::{DropCounter, MessageKind, SignalingChannel, SignalingMessage, Subscription},
    store::MessageFeed,
};

const ENDED: &str = "ENDED";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Ended,
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed(_))
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Negotiating => 1,
            Self::Connected => 2,
            Self::Ended | Self::Failed(_) => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyAction {
    SendOffer,
    SendAnswer,
    AwaitOffer,
}

/// What `on_ready` does, given the role and whether a remote offer is stored.
pub fn ready_action(role: Role, has_offer: bool) -> ReadyAction {
    match (role, has_offer) {
        (_, true) => ReadyAction::SendAnswer,
        (Role::Initiator, false) => ReadyAction::SendOffer,
        (Role::Responder, false) => ReadyAction::AwaitOffer,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub constraints: MediaConstraints,
    /// Zero disables stats collection.
    pub stats_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            constraints: config.rtc.constraints(),
            stats_interval: config.session.stats_interval(),
        }
    }
}

#[derive(Default)]
struct Flow {
    ready: bool,
    stored_offer: Option<SessionDescription>,
    /// An offer or answer went out.
    responded: bool,
}

struct Shared {
    call_id: CallId,
    role: Role,
    channel: SignalingChannel,
    negotiator: Negotiator,
    devices: sync::Mutex<Box<dyn CaptureDevices>>,
    flow: sync::Mutex<Flow>,
    seen_candidates: Mutex<HashSet<IceCandidate>>,
    state: watch::Sender<SessionState>,
    controls: watch::Sender<MediaControls>,
    local_tracks: watch::Sender<Vec<MediaTrack>>,
    remote_tracks: watch::Sender<Vec<MediaTrack>>,
    stats: watch::Sender<Option<StatsSnapshot>>,
    stats_interval: Duration,
    stats_task: Mutex<Option<JoinHandle<()>>>,
    drops: DropCounter,
    shutdown: watch::Sender<bool>,
    disconnected: AtomicBool,
}

impl Shared {
    /// Moves forward only; terminal states stick.
    fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if next.rank() <= state.rank() {
                return false;
            }
            debug!("session {:?} -> {:?}", state, next);
            *state = next;
            true
        })
    }

    fn fail(&self, reason: String) {
        if self.advance(SessionState::Failed(reason.clone())) {
            error!("call failed: {}", reason);
        }
        self.shutdown.send_replace(true);
    }

    /// Negotiation errors are fatal to the call.
    fn escalate(&self, err: Error) -> Error {
        if let Error::Negotiation(inner) = &err {
            self.fail(inner.to_string());
        }
        err
    }

    fn is_over(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(ClosedError.into());
        }
        Ok(())
    }

    fn update_connected(&self) {
        if self.negotiator.state() == NegotiationState::Stable {
            self.advance(SessionState::Connected);
        }
    }

    async fn attach_media(&self) -> Result<()> {
        let tracks = {
            let mut devices = self.devices.lock().await;
            devices.start().await.map_err(Error::Capture)?
        };
        for track in &tracks {
            self.negotiator.add_track(track.clone()).await?;
        }
        debug!("attached {} local tracks", tracks.len());
        self.local_tracks.send_replace(tracks);

        let controls = *self.controls.borrow();
        let defaults = MediaControls::default();
        let mut devices = self.devices.lock().await;
        if controls.microphone_enabled != defaults.microphone_enabled {
            devices
                .set_microphone_enabled(controls.microphone_enabled)
                .await
                .map_err(Error::Capture)?;
        }
        if controls.camera_enabled != defaults.camera_enabled {
            devices
                .set_camera_enabled(controls.camera_enabled)
                .await
                .map_err(Error::Capture)?;
        }
        if controls.camera_facing != defaults.camera_facing {
            devices
                .flip_camera(controls.camera_facing)
                .await
                .map_err(Error::Capture)?;
        }
        Ok(())
    }

    async fn send_offer(&self, flow: &mut Flow) -> Result<()> {
        let offer = self.negotiator.create_offer().await?;
        self.negotiator.set_local_description(offer.clone()).await?;
        flow.responded = true;
        info!("sending offer");
        self.channel
            .send(&self.call_id, &SignalingMessage::offer(offer.into_sdp()))
            .await?;
        Ok(())
    }

    async fn send_answer(&self, flow: &mut Flow) -> Result<()> {
        let Some(offer) = flow.stored_offer.clone() else {
            return Ok(());
        };
        self.negotiator.set_remote_description(offer).await?;
        let answer = self.negotiator.create_answer().await?;
        self.negotiator.set_local_description(answer.clone()).await?;
        flow.responded = true;
        self.update_connected();
        info!("sending answer");
        self.channel
            .send(&self.call_id, &SignalingMessage::answer(answer.into_sdp()))
            .await?;
        Ok(())
    }

    async fn on_ready(&self) -> Result<()> {
        let mut flow = self.flow.lock().await;
        if flow.ready {
            trace!("already ready");
            return Ok(());
        }
        if self.is_over() {
            debug!("call is over, media not started");
            return Ok(());
        }
        flow.ready = true;
        self.advance(SessionState::Negotiating);

        if let Err(err) = self.attach_media().await {
            if let Error::Capture(inner) = &err {
                self.fail(format!("{:#}", inner));
            }
            return Err(self.escalate(err));
        }
        if self.is_over() {
            debug!("call ended while starting media");
            return Ok(());
        }
        let result = match ready_action(self.role, flow.stored_offer.is_some()) {
            ReadyAction::SendOffer => self.send_offer(&mut flow).await,
            ReadyAction::SendAnswer => self.send_answer(&mut flow).await,
            ReadyAction::AwaitOffer => {
                debug!("waiting for the offer");
                Ok(())
            }
        };
        result.map_err(|err| self.escalate(err))
    }

    async fn handle_offer(&self, sdp: String) -> Result<()> {
        let mut flow = self.flow.lock().await;
        if self.is_over() {
            debug!("offer ignored after the call ended");
            return Ok(());
        }
        if let Some(stored) = &flow.stored_offer {
            if stored.sdp() == &sdp {
                debug!("duplicate offer ignored");
            } else {
                warn!("renegotiation is not supported, offer ignored");
            }
            return Ok(());
        }
        debug!("offer stored");
        flow.stored_offer = Some(SessionDescription::offer(sdp));
        if flow.ready && !flow.responded {
            self.send_answer(&mut flow).await?;
        }
        Ok(())
    }

    async fn handle_answer(&self, sdp: String) -> Result<()> {
        let _flow = self.flow.lock().await;
        if self.is_over() {
            debug!("answer ignored after the call ended");
            return Ok(());
        }
        match self.negotiator.state() {
            NegotiationState::HaveLocalOffer => {
                self.negotiator
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await?;
                self.update_connected();
                info!("answer applied");
            }
            NegotiationState::Stable => debug!("duplicate answer ignored"),
            state => warn!("answer ignored in {:?}", state),
        }
        Ok(())
    }

    async fn handle_candidate(&self, message: &SignalingMessage) -> Result<()> {
        if self.is_over() || self.negotiator.is_closed() {
            debug!("candidate dropped after the call ended");
            return Ok(());
        }
        let candidate = match message.to_ice_candidate() {
            Ok(candidate) => candidate,
            Err(err) => {
                self.drops.record(&err);
                return Ok(());
            }
        };
        if !lock(&self.seen_candidates).insert(candidate.clone()) {
            trace!("duplicate candidate ignored");
            return Ok(());
        }
        match self.negotiator.add_ice_candidate(candidate).await {
            Ok(outcome) => {
                trace!("candidate {:?}", outcome);
                Ok(())
            }
            Err(err) if err.is_closed() => {
                debug!("candidate dropped after close");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_message(&self, message: SignalingMessage) -> Result<()> {
        match message.kind {
            MessageKind::Offer => self.handle_offer(message.payload).await,
            MessageKind::Answer => self.handle_answer(message.payload).await,
            MessageKind::IceCandidate => self.handle_candidate(&message).await,
            MessageKind::SessionState if message.payload == ENDED => {
                info!("remote ended the call");
                self.advance(SessionState::Ended);
                Ok(())
            }
            MessageKind::SessionState => {
                debug!("remote state {}", message.payload);
                Ok(())
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::IceCandidate(candidate) => {
                let message = SignalingMessage::ice_candidate(&candidate);
                if let Err(err) = self.channel.send(&self.call_id, &message).await {
                    debug!("local candidate {} dropped: {}", candidate.candidate, err);
                }
            }
            EngineEvent::RemoteTrack(track) => {
                if self.disconnected.load(Ordering::SeqCst) {
                    return;
                }
                info!("remote {:?} track {}", track.kind, track.id);
                self.remote_tracks.send_modify(|tracks| tracks.push(track));
            }
            EngineEvent::ConnectionState(state) => {
                debug!("connection {}", state);
                match state {
                    ConnectionState::Connected => self.start_stats(),
                    ConnectionState::Disconnected | ConnectionState::Closed => self.stop_stats(),
                    ConnectionState::Failed => {
                        self.stop_stats();
                        self.fail(format!("connection {}", state));
                    }
                    ConnectionState::New | ConnectionState::Connecting => {}
                }
            }
        }
    }

    fn start_stats(self: &Arc<Self>) {
        if self.stats_interval.is_zero() {
            return;
        }
        let mut slot = lock(&self.stats_task);
        if slot.is_some() {
            return;
        }
        let shared = Arc::downgrade(self);
        let period = self.stats_interval;
        *slot = Some(spawn(collect_stats(shared, period).in_current_span()));
    }

    fn stop_stats(&self) {
        if let Some(task) = lock(&self.stats_task).take() {
            task.abort();
        }
    }
}

async fn collect_stats(shared: Weak<Shared>, period: Duration) {
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match shared.negotiator.stats().await {
            Ok(snapshot) => {
                trace!("stats: {} entries", snapshot.entries);
                shared.stats.send_replace(Some(snapshot));
            }
            Err(err) if err.is_closed() => return,
            Err(err) => debug!("stats failed: {}", err),
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    mut subscription: Subscription,
    mut events: mpsc::Receiver<EngineEvent>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut feed_open = true;
    let mut events_open = true;
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            message = subscription.recv(), if feed_open => {
                let Some(message) = message else {
                    debug!("signaling feed closed");
                    feed_open = false;
                    continue;
                };
                match shared.handle_message(message).await {
                    Ok(()) => {}
                    Err(err) if err.is_closed() => debug!("{}", err),
                    Err(Error::Negotiation(err)) => {
                        shared.fail(err.to_string());
                        break;
                    }
                    Err(err) => warn!("{}", err),
                }
            }
            event = events.recv(), if events_open => {
                let Some(event) = event else {
                    debug!("engine events closed");
                    events_open = false;
                    continue;
                };
                shared.handle_event(event).await;
            }
        }
    }
    subscription.close();
    shared.stop_stats();
    trace!("session task finished");
}

/// Runs the negotiation of one call and exposes its controls.
pub struct CallSession {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    teardown: OnceCell<()>,
}

impl CallSession {
    /// Subscribes to the call's signaling feed and starts the background task.
    pub fn new(
        call_id: impl Into<CallId>,
        role: Role,
        feed: Arc<dyn MessageFeed>,
        engine: Engine,
        devices: Box<dyn CaptureDevices>,
        options: SessionOptions,
    ) -> Self {
        let call_id = call_id.into();
        let channel = SignalingChannel::new(feed, role);
        let subscription = channel.subscribe(&call_id);
        let shared = Arc::new(Shared {
            call_id: call_id.clone(),
            role,
            channel,
            negotiator: Negotiator::new(engine.connection, options.constraints),
            devices: sync::Mutex::new(devices),
            flow: Default::default(),
            seen_candidates: Default::default(),
            state: watch::channel(SessionState::Idle).0,
            controls: watch::channel(MediaControls::default()).0,
            local_tracks: watch::channel(vec![]).0,
            remote_tracks: watch::channel(vec![]).0,
            stats: watch::channel(None).0,
            stats_interval: options.stats_interval,
            stats_task: Mutex::new(None),
            drops: subscription.drops().clone(),
            shutdown: watch::channel(false).0,
            disconnected: AtomicBool::new(false),
        });
        let span = info_span!("call", call_id = %call_id, role = %role);
        let task = spawn(run(shared.clone(), subscription, engine.events).instrument(span));
        Self {
            shared,
            task: Mutex::new(Some(task)),
            teardown: OnceCell::new(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.shared.call_id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Attaches local media, then offers or answers. Later calls do nothing.
    pub async fn on_ready(&self) -> Result<()> {
        self.shared.ensure_open()?;
        let span = info_span!("call", call_id = %self.shared.call_id, role = %self.shared.role);
        self.shared.on_ready().instrument(span).await
    }

    pub async fn toggle_microphone(&self, enabled: bool) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared
            .controls
            .send_modify(|controls| controls.microphone_enabled = enabled);
        let mut devices = self.shared.devices.lock().await;
        devices
            .set_microphone_enabled(enabled)
            .await
            .map_err(Error::Capture)
    }

    pub async fn toggle_camera(&self, enabled: bool) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared
            .controls
            .send_modify(|controls| controls.camera_enabled = enabled);
        let mut devices = self.shared.devices.lock().await;
        devices.set_camera_enabled(enabled).await.map_err(Error::Capture)
    }

    pub async fn flip_camera(&self) -> Result<()> {
        self.shared.ensure_open()?;
        let mut facing = Default::default();
        self.shared.controls.send_modify(|controls| {
            controls.camera_facing = controls.camera_facing.flipped();
            facing = controls.camera_facing;
        });
        let mut devices = self.shared.devices.lock().await;
        devices.flip_camera(facing).await.map_err(Error::Capture)
    }

    /// Tells the peer, releases media, closes the connection and stops the task. Idempotent;
    /// concurrent callers return once the first teardown has finished.
    pub async fn disconnect(&self) -> Result<()> {
        self.teardown.get_or_init(|| self.tear_down()).await;
        Ok(())
    }

    async fn tear_down(&self) {
        let shared = &self.shared;
        shared.disconnected.store(true, Ordering::SeqCst);
        let span = info_span!("call", call_id = %shared.call_id, role = %shared.role);
        async {
            info!("disconnecting");
            if let Err(err) = shared
                .channel
                .send(&shared.call_id, &SignalingMessage::session_state(ENDED))
                .await
            {
                debug!("could not notify the peer: {}", err);
            }
            shared.advance(SessionState::Ended);
            shared.stop_stats();
            shared.local_tracks.send_replace(vec![]);
            shared.remote_tracks.send_replace(vec![]);
            shared.negotiator.close();
            if let Err(err) = shared.devices.lock().await.stop().await {
                warn!("failed to stop capture: {:#}", err);
            }
            shared.shutdown.send_replace(true);
        }
        .instrument(span)
        .await;

        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!("session task panicked: {}", err);
                }
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.shared.negotiator.state()
    }

    pub fn controls(&self) -> MediaControls {
        *self.shared.controls.borrow()
    }

    pub fn watch_controls(&self) -> watch::Receiver<MediaControls> {
        self.shared.controls.subscribe()
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.shared.local_tracks.borrow().clone()
    }

    pub fn remote_tracks(&self) -> Vec<MediaTrack> {
        self.shared.remote_tracks.borrow().clone()
    }

    pub fn watch_remote_tracks(&self) -> watch::Receiver<Vec<MediaTrack>> {
        self.shared.remote_tracks.subscribe()
    }

    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.shared.stats.borrow().clone()
    }

    pub fn dropped_messages(&self) -> u64 {
        self.shared.drops.count()
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if self.teardown.initialized() {
            return;
        }
        self.shared.disconnected.store(true, Ordering::SeqCst);
        self.shared.negotiator.close();
        self.shared.stop_stats();
        self.shared.shutdown.send_replace(true);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_actions() {
        assert_eq!(ready_action(Role::Initiator, false), ReadyAction::SendOffer);
        assert_eq!(ready_action(Role::Responder, false), ReadyAction::AwaitOffer);
        assert_eq!(ready_action(Role::Initiator, true), ReadyAction::SendAnswer);
        assert_eq!(ready_action(Role::Responder, true), ReadyAction::SendAnswer);
    }

    #[test]
    fn states_only_move_forward() {
        use SessionState as S;
        assert!(S::Idle.rank() < S::Negotiating.rank());
        assert!(S::Negotiating.rank() < S::Connected.rank());
        assert_eq!(S::Ended.rank(), S::Failed("x".into()).rank());
        assert!(S::Failed(String::new()).is_terminal());
        assert!(!S::Connected.is_terminal());
    }

    #[test]
    fn role_wire_names() {
        assert_eq!(serde_json::to_value(Role::Initiator).unwrap(), "INITIATOR");
        assert_eq!(
            serde_json::from_value::<Role>("RESPONDER".into()).unwrap(),
            Role::Responder
        );
    }

    #[test]
    fn options_follow_config() {
        let mut config = Config::default();
        config.rtc.offer_to_receive_audio = false;
        config.session.stats_interval_sec = 2;
        let options = SessionOptions::from(&config);
        assert!(!options.constraints.offer_to_receive_audio);
        assert_eq!(options.stats_interval, Duration::from_secs(2));
    }
}
