use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::client::media::LocalMedia;
use crate::error::NegotiationError;
use crate::protocol::{IceCandidate, SdpType, SessionDescription, SessionId};

// ─── Transport seam ─────────────────────────────────────────────────────────

/// Connectivity state as reported by the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from the peer connection, delivered in order on one channel so
/// the negotiation task consumes them one at a time.
#[derive(Debug)]
pub enum TransportEvent<T> {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(T),
}

/// The handful of peer-connection calls negotiation needs.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    type RemoteTrack: Send + 'static;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

pub type RemoteTrackOf<F> = <<F as PeerFactory>::Transport as PeerTransport>::RemoteTrack;

/// Opens one transport per remote peer, with the local tracks attached.
#[async_trait]
pub trait PeerFactory: Send + Sync + 'static {
    type Transport: PeerTransport;

    async fn open(
        &self,
        peer: &SessionId,
        media: Arc<LocalMedia>,
        events: mpsc::UnboundedSender<
            TransportEvent<<Self::Transport as PeerTransport>::RemoteTrack>,
        >,
    ) -> Result<Self::Transport, NegotiationError>;
}

// ─── webrtc-rs implementation ───────────────────────────────────────────────

/// Builds `RTCPeerConnection`s configured with the STUN servers.
#[derive(Debug, Clone)]
pub struct RtcPeerFactory {
    stun_urls: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(stun_urls: Vec<String>) -> Self {
        Self { stun_urls }
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            }]
        };

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    type Transport = RtcPeer;

    async fn open(
        &self,
        peer: &SessionId,
        media: Arc<LocalMedia>,
        events: mpsc::UnboundedSender<TransportEvent<Arc<TrackRemote>>>,
    ) -> Result<RtcPeer, NegotiationError> {
        let pc = self.create_peer_connection().await?;

        for track in media.tracks() {
            let local: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
            let sender = pc.add_track(local).await?;
            // Drain RTCP so interceptors keep running.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {e}"),
                }
            })
        }));

        let tx = events.clone();
        let label = peer.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(peer = %label, ?state, "peer connection state");
            let mapped = match state {
                RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                    TransportState::New
                }
                RTCPeerConnectionState::Connecting => TransportState::Connecting,
                RTCPeerConnectionState::Connected => TransportState::Connected,
                RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                RTCPeerConnectionState::Failed => TransportState::Failed,
                RTCPeerConnectionState::Closed => TransportState::Closed,
            };
            let _ = tx.send(TransportEvent::StateChanged(mapped));
            Box::pin(async {})
        }));

        let tx = events;
        let label = peer.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            info!(
                peer = %label,
                kind = %track.kind(),
                ssrc = track.ssrc(),
                "remote track received"
            );
            let _ = tx.send(TransportEvent::RemoteTrack(track));
            Box::pin(async {})
        }));

        Ok(RtcPeer { pc })
    }
}

/// One `RTCPeerConnection` toward a remote session.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcPeer {
    type RemoteTrack = Arc<TrackRemote>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let parsed = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?;

        self.pc
            .set_remote_description(parsed)
            .await
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use crate::client::media::MediaConstraints;
    use crate::client::negotiation::{Effect, NegotiationEvent, PeerNegotiation, Phase, Role};
    use crate::protocol::SignalKind;

    type Event = NegotiationEvent<Arc<TrackRemote>>;

    /// Route signal effects to the other side the way the relay would,
    /// keeping every candidate payload for inspection.
    fn relay(
        effects: Vec<Effect<Arc<TrackRemote>>>,
        candidates: &mut Vec<serde_json::Value>,
    ) -> Vec<Event> {
        effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::Signal { kind, payload } => Some(match kind {
                    SignalKind::Offer => NegotiationEvent::Offer(payload),
                    SignalKind::Answer => NegotiationEvent::Answer(payload),
                    SignalKind::IceCandidate => {
                        candidates.push(payload.clone());
                        NegotiationEvent::RemoteCandidate(payload)
                    }
                }),
                Effect::Failed(e) => panic!("negotiation failed: {e}"),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn two_local_peers_reach_connected() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let factory = RtcPeerFactory::new(vec![]);
        let media = Arc::new(LocalMedia::new(MediaConstraints {
            audio: true,
            video: false,
        }));

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a_peer = factory.open(&"B".into(), media.clone(), a_tx).await.unwrap();
        let b_peer = factory.open(&"A".into(), media.clone(), b_tx).await.unwrap();
        let mut a = PeerNegotiation::new("B".into(), Role::Initiator, a_peer);
        let mut b = PeerNegotiation::new("A".into(), Role::Responder, b_peer);

        let mut candidates = Vec::new();
        let mut inbox_a: VecDeque<Event> = VecDeque::new();
        let mut inbox_b: VecDeque<Event> = VecDeque::new();

        inbox_b.extend(relay(a.handle(NegotiationEvent::Start).await, &mut candidates));
        inbox_a.extend(relay(b.handle(NegotiationEvent::Start).await, &mut candidates));
        assert_eq!(a.phase(), Phase::LocalDescriptionSet);
        assert!(a.transport().pc.local_description().await.is_some());
        assert_eq!(b.phase(), Phase::AwaitingOffer);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while a.phase() != Phase::Connected || b.phase() != Phase::Connected {
            if let Some(event) = inbox_a.pop_front() {
                inbox_b.extend(relay(a.handle(event).await, &mut candidates));
                continue;
            }
            if let Some(event) = inbox_b.pop_front() {
                inbox_a.extend(relay(b.handle(event).await, &mut candidates));
                continue;
            }
            tokio::select! {
                Some(event) = a_rx.recv() => inbox_a.push_back(NegotiationEvent::Transport(event)),
                Some(event) = b_rx.recv() => inbox_b.push_back(NegotiationEvent::Transport(event)),
                _ = tokio::time::sleep_until(deadline) => {
                    panic!("not connected in time: a={} b={}", a.phase(), b.phase())
                }
            }
        }

        assert!(b.transport().pc.local_description().await.is_some());
        assert!(!candidates.is_empty());
        for candidate in &candidates {
            assert!(candidate["candidate"]
                .as_str()
                .is_some_and(|c| c.starts_with("candidate:")));
            assert!(serde_json::from_value::<IceCandidate>(candidate.clone()).is_ok());
        }

        a.handle(NegotiationEvent::Close).await;
        b.handle(NegotiationEvent::Close).await;
        assert_eq!(a.phase(), Phase::Closed);
        assert_eq!(b.phase(), Phase::Closed);
    }
}
