use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use chrono::Utc;
use tokio::{spawn, sync::mpsc};
use tracing::{debug, trace, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder,
    },
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

use crate::config::RtcConfig;

use super::{
    Completion, ConnectionState, Engine, EngineEvent, IceCandidate, MediaConstraints, MediaTrack,
    PeerEngine, SdpKind, SessionDescription, StatsSnapshot, TrackKind,
};

const STREAM_ID: &str = "signbridge";

fn create_config(config: &RtcConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: config.ice_servers.clone(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

async fn create_peer_connection(config: &RtcConfig) -> Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build()
        .new_peer_connection(create_config(config))
        .await?)
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match desc.kind() {
        SdpKind::Offer => RTCSessionDescription::offer(desc.into_sdp()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.into_sdp()),
    }
}

fn to_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

/// [`PeerEngine`] backed by a `webrtc` crate `RTCPeerConnection`.
pub struct RtcEngine {
    rtc: Arc<RTCPeerConnection>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl RtcEngine {
    pub async fn connect(config: &RtcConfig, event_buffer: usize) -> Result<Engine> {
        let rtc = Arc::new(create_peer_connection(config).await?);
        let (events_tx, events_rx) = mpsc::channel(event_buffer.max(1));

        {
            let events_tx = events_tx.clone();
            rtc.on_ice_candidate(Box::new(move |candidate| {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    // `None` marks the end of gathering.
                    let Some(candidate) = candidate else {
                        trace!("ice gathering complete");
                        return;
                    };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(err) => {
                            warn!("failed to serialize local candidate: {}", err);
                            return;
                        }
                    };
                    let candidate = IceCandidate::new(
                        init.sdp_mid.unwrap_or_default(),
                        init.sdp_mline_index.unwrap_or_default(),
                        init.candidate,
                    );
                    let _ = events_tx.send(EngineEvent::IceCandidate(candidate)).await;
                })
            }));
        }
        {
            let events_tx = events_tx.clone();
            rtc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Unspecified => return,
                    };
                    let remote = MediaTrack::new(track.id(), kind);
                    debug!("remote track added: {:?}", remote);
                    let _ = events_tx.send(EngineEvent::RemoteTrack(remote)).await;
                })
            }));
        }
        rtc.on_peer_connection_state_change(Box::new(move |state| {
            debug!("on_peer_connection_state_change {}", state);
            let events_tx = events_tx.clone();
            Box::pin(async move {
                let state = to_connection_state(state);
                let _ = events_tx.send(EngineEvent::ConnectionState(state)).await;
            })
        }));

        let engine = Self {
            rtc,
            local_tracks: Mutex::new(vec![]),
        };
        Ok(Engine::new(Arc::new(engine), events_rx))
    }

    async fn receive_only_transceivers(
        rtc: &RTCPeerConnection,
        constraints: &MediaConstraints,
    ) -> Result<(), webrtc::Error> {
        let transceivers = rtc.get_transceivers().await;
        let wanted = [
            (constraints.offer_to_receive_audio, RTPCodecType::Audio),
            (constraints.offer_to_receive_video, RTPCodecType::Video),
        ];
        for (wanted, kind) in wanted {
            if !wanted || transceivers.iter().any(|t| t.kind() == kind) {
                continue;
            }
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            };
            rtc.add_transceiver_from_kind(kind, Some(init)).await?;
        }
        Ok(())
    }
}

impl PeerEngine for RtcEngine {
    fn create_offer(&self, constraints: &MediaConstraints, done: Completion<SessionDescription>) {
        let rtc = self.rtc.clone();
        let constraints = *constraints;
        spawn(async move {
            if let Err(err) = Self::receive_only_transceivers(&rtc, &constraints).await {
                done.fail(err.to_string());
                return;
            }
            match rtc.create_offer(None).await {
                Ok(offer) => done.succeed(SessionDescription::offer(offer.sdp)),
                Err(err) => done.fail(err.to_string()),
            };
        });
    }

    fn create_answer(&self, _constraints: &MediaConstraints, done: Completion<SessionDescription>) {
        let rtc = self.rtc.clone();
        spawn(async move {
            match rtc.create_answer(None).await {
                Ok(answer) => done.succeed(SessionDescription::answer(answer.sdp)),
                Err(err) => done.fail(err.to_string()),
            };
        });
    }

    fn set_local_description(&self, desc: SessionDescription, done: Completion<()>) {
        let rtc = self.rtc.clone();
        spawn(async move {
            let result = match to_rtc(desc) {
                Ok(desc) => rtc.set_local_description(desc).await,
                Err(err) => Err(err),
            };
            done.complete(result.map_err(|err| err.to_string()));
        });
    }

    fn set_remote_description(&self, desc: SessionDescription, done: Completion<()>) {
        let rtc = self.rtc.clone();
        spawn(async move {
            let result = match to_rtc(desc) {
                Ok(desc) => rtc.set_remote_description(desc).await,
                Err(err) => Err(err),
            };
            done.complete(result.map_err(|err| err.to_string()));
        });
    }

    fn add_ice_candidate(&self, candidate: IceCandidate, done: Completion<()>) {
        let rtc = self.rtc.clone();
        spawn(async move {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: Some(candidate.mid),
                sdp_mline_index: Some(candidate.m_line_index),
                username_fragment: None,
            };
            let result = rtc.add_ice_candidate(init).await;
            done.complete(result.map_err(|err| err.to_string()));
        });
    }

    fn add_track(&self, track: MediaTrack, done: Completion<()>) {
        let mime_type = match track.kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            STREAM_ID.to_owned(),
        ));
        self.local_tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(local.clone());
        let rtc = self.rtc.clone();
        spawn(async move {
            let sender = match rtc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => sender,
                Err(err) => {
                    done.fail(err.to_string());
                    return;
                }
            };
            debug!("local {:?} track added: {}", codec_type(track.kind), track.id);
            done.succeed(());
            // RTCP has to be drained for the interceptors to work.
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
    }

    fn stats(&self, done: Completion<StatsSnapshot>) {
        let rtc = self.rtc.clone();
        spawn(async move {
            let report = rtc.get_stats().await;
            done.succeed(StatsSnapshot {
                collected_at: Utc::now(),
                entries: report.reports.len(),
            });
        });
    }

    fn close(&self) {
        trace!("close connection");
        self.local_tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let rtc = self.rtc.clone();
        let close = async move {
            if let Err(err) = rtc.close().await {
                debug!("failed to close connection: {}", err);
            }
            trace!("connection closed");
        };
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(close);
        } else {
            warn!("no runtime available, connection is left to drop");
        }
    }
}
