use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{self, watch};
use tracing::{debug, trace, warn};

use crate::{
    engine::{
        single_shot, IceCandidate, MediaConstraints, MediaTrack, PeerEngine, Pending, SdpKind,
        SessionDescription, StatsSnapshot,
    },
    error::{ClosedError, Error, NegotiationError, Result},
};

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            // The sender lives as long as the negotiator.
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// `None` if a `kind` description from `side` is not acceptable in `state`.
pub fn next_state(state: NegotiationState, side: Side, kind: SdpKind) -> Option<NegotiationState> {
    use NegotiationState as S;
    match (state, side, kind) {
        (S::New, Side::Local, SdpKind::Offer) => Some(S::HaveLocalOffer),
        (S::New, Side::Remote, SdpKind::Offer) => Some(S::HaveRemoteOffer),
        (S::HaveLocalOffer, Side::Remote, SdpKind::Answer) => Some(S::Stable),
        (S::HaveRemoteOffer, Side::Local, SdpKind::Answer) => Some(S::Stable),
        _ => None,
    }
}

/// Rewrites lower-case codec names the way some remote stacks expect them.
pub fn normalize_codecs(sdp: &str) -> String {
    sdp.replace("vp9", "VP9")
        .replace("vp8", "VP8")
        .replace("h264", "H264")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// Held until a remote description is set.
    Buffered,
    /// The engine refused this candidate; negotiation goes on.
    Rejected(String),
}

#[derive(Default)]
struct CandidateBuffer {
    remote_applied: bool,
    pending: Vec<IceCandidate>,
}

/// Sequences SDP and ICE operations against one engine connection.
pub struct Negotiator {
    engine: Arc<dyn PeerEngine>,
    constraints: MediaConstraints,
    state: Mutex<NegotiationState>,
    candidates: sync::Mutex<CandidateBuffer>,
    closed: watch::Sender<bool>,
}

impl Negotiator {
    pub fn new(engine: Arc<dyn PeerEngine>, constraints: MediaConstraints) -> Self {
        Self {
            engine,
            constraints,
            state: Mutex::new(NegotiationState::New),
            candidates: Default::default(),
            closed: watch::channel(false).0,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, NegotiationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> NegotiationState {
        *self.lock_state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == NegotiationState::Closed
    }

    pub async fn has_remote_description(&self) -> bool {
        self.candidates.lock().await.remote_applied
    }

    pub async fn pending_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().await.pending.clone()
    }

    fn ensure_open(&self) -> Result<NegotiationState> {
        let state = self.state();
        if state == NegotiationState::Closed {
            return Err(ClosedError.into());
        }
        Ok(state)
    }

    /// Waits for the engine, or fails with `Cancelled` as soon as the negotiator is closed.
    async fn suspend<T>(&self, op: &'static str, pending: Pending<T>) -> Result<T> {
        tokio::select! {
            result = pending.wait() => Ok(result?),
            _ = wait_closed(self.closed.subscribe()) => {
                debug!("{} cancelled by close", op);
                Err(NegotiationError::Cancelled(op).into())
            }
        }
    }

    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let (done, pending) = single_shot("create offer");
        self.engine.create_offer(&self.constraints, done);
        self.suspend("create offer", pending).await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.ensure_open()?;
        if state != NegotiationState::HaveRemoteOffer {
            return Err(NegotiationError::InvalidState {
                op: "create answer",
                state,
            }
            .into());
        }
        let (done, pending) = single_shot("create answer");
        self.engine.create_answer(&self.constraints, done);
        self.suspend("create answer", pending).await
    }

    async fn apply_description(&self, side: Side, desc: SessionDescription) -> Result<()> {
        let op = match side {
            Side::Local => "set local description",
            Side::Remote => "set remote description",
        };
        let state = self.ensure_open()?;
        let Some(next) = next_state(state, side, desc.kind()) else {
            return Err(NegotiationError::InvalidState { op, state }.into());
        };
        let desc = SessionDescription::new(desc.kind(), normalize_codecs(desc.sdp()));
        let (done, pending) = single_shot(op);
        match side {
            Side::Local => self.engine.set_local_description(desc, done),
            Side::Remote => self.engine.set_remote_description(desc, done),
        }
        self.suspend(op, pending).await?;

        {
            let mut state = self.lock_state();
            if *state == NegotiationState::Closed {
                return Err(ClosedError.into());
            }
            trace!("{:?} -> {:?}", *state, next);
            *state = next;
        }
        Ok(())
    }

    pub async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.apply_description(Side::Local, desc).await
    }

    /// Applies the description, then flushes the buffered candidates in arrival order.
    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.apply_description(Side::Remote, desc).await?;

        let mut buffer = self.candidates.lock().await;
        buffer.remote_applied = true;
        let pending = std::mem::take(&mut buffer.pending);
        if !pending.is_empty() {
            debug!("flushing {} buffered candidates", pending.len());
        }
        for candidate in pending {
            self.apply_candidate(candidate).await?;
        }
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<CandidateOutcome> {
        self.ensure_open()?;
        let mut buffer = self.candidates.lock().await;
        if !buffer.remote_applied {
            trace!("buffered candidate for {}", candidate.mid);
            buffer.pending.push(candidate);
            return Ok(CandidateOutcome::Buffered);
        }
        self.apply_candidate(candidate).await
    }

    /// Must be called with the candidate buffer locked.
    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<CandidateOutcome> {
        let (done, pending) = single_shot("add ice candidate");
        self.engine.add_ice_candidate(candidate, done);
        match self.suspend("add ice candidate", pending).await {
            Ok(()) => Ok(CandidateOutcome::Applied),
            Err(Error::Negotiation(NegotiationError::Rejected { reason, .. })) => {
                warn!("candidate rejected: {}", reason);
                Ok(CandidateOutcome::Rejected(reason))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn add_track(&self, track: MediaTrack) -> Result<()> {
        self.ensure_open()?;
        let (done, pending) = single_shot("add track");
        self.engine.add_track(track, done);
        self.suspend("add track", pending).await
    }

    pub async fn stats(&self) -> Result<StatsSnapshot> {
        self.ensure_open()?;
        let (done, pending) = single_shot("get stats");
        self.engine.stats(done);
        self.suspend("get stats", pending).await
    }

    /// Cancels every outstanding operation and closes the engine. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if *state == NegotiationState::Closed {
                return;
            }
            *state = NegotiationState::Closed;
        }
        self.closed.send_replace(true);
        self.engine.close();
        debug!("negotiator closed");
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        self.close();
    }
}
