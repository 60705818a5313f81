use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::media::{LocalMedia, MediaCapture, MediaConstraints, MediaKind};
use crate::client::negotiation::{spawn_peer, NegotiationEvent, PeerContext, PeerHandle, Phase, Role};
use crate::client::rtc::{PeerFactory, RemoteTrackOf};
use crate::client::transport::{RelayEvent, SignalSink};
use crate::config::ClientConfig;
use crate::error::{NegotiationError, SessionError, TransportError};
use crate::protocol::{ClientMessage, ForwardedSignal, RoomId, ServerEvent, SessionId, SignalKind};

// ─── Upward events ──────────────────────────────────────────────────────────

/// Everything the embedding application is told about a call.
#[derive(Debug)]
pub enum SessionEvent<R> {
    RelayConnected(SessionId),
    RelayReconnected(SessionId),
    RelayDisconnected,
    /// The relay could not be reached again; the call cannot continue.
    RelayGaveUp,
    PeerPhase { peer: SessionId, phase: Phase },
    RemoteStream { peer: SessionId, track: R },
    /// Show `error.user_message()`; the rest of the call is unaffected.
    PeerFailed { peer: SessionId, error: NegotiationError },
    PeerLeft(SessionId),
}

struct ActiveCall {
    room: RoomId,
    media: Arc<LocalMedia>,
}

// ─── Controller ─────────────────────────────────────────────────────────────

/// Orchestrates one call: local capture, relay membership and one
/// negotiation task per remote peer.
pub struct SessionController<C, F, S>
where
    C: MediaCapture,
    F: PeerFactory,
    S: SignalSink,
{
    capture: C,
    factory: Arc<F>,
    signals: Arc<S>,
    user_id: Option<String>,
    connect_timeout: Option<Duration>,
    constraints: MediaConstraints,

    local_session: Option<SessionId>,
    call: Option<ActiveCall>,
    peers: HashMap<SessionId, PeerHandle<RemoteTrackOf<F>>>,
    events: mpsc::UnboundedSender<SessionEvent<RemoteTrackOf<F>>>,
}

impl<C, F, S> SessionController<C, F, S>
where
    C: MediaCapture,
    F: PeerFactory,
    S: SignalSink,
{
    pub fn new(
        capture: C,
        factory: F,
        signals: Arc<S>,
        config: &ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent<RemoteTrackOf<F>>>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            capture,
            factory: Arc::new(factory),
            signals,
            user_id: config.user_id.clone(),
            connect_timeout: config.peer_connect_timeout,
            constraints: MediaConstraints::default(),
            local_session: None,
            call: None,
            peers: HashMap::new(),
            events,
        };
        (controller, rx)
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.call.as_ref().map(|c| &c.room)
    }

    pub fn local_media(&self) -> Option<&Arc<LocalMedia>> {
        self.call.as_ref().map(|c| &c.media)
    }

    pub fn peer_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Acquire local media and join `room` (or a freshly generated one). The
    /// join is sent now if the relay is connected, otherwise on connect.
    pub async fn join_call(&mut self, room: Option<RoomId>) -> Result<RoomId, SessionError> {
        if let Some(call) = &self.call {
            return Err(SessionError::AlreadyInCall(call.room.clone()));
        }

        let room = room.unwrap_or_else(RoomId::generate);
        let media = Arc::new(self.capture.acquire(self.constraints).await?);
        self.call = Some(ActiveCall {
            room: room.clone(),
            media,
        });
        info!(room = %room, "joining call");

        match self.send_join() {
            Ok(()) | Err(TransportError::NotConnected) => Ok(room),
            Err(e) => {
                self.leave_call().await;
                Err(e.into())
            }
        }
    }

    /// Stop local tracks, close every peer and tell the relay. Idempotent.
    pub async fn leave_call(&mut self) {
        let Some(call) = self.call.take() else {
            return;
        };
        call.media.stop_all();
        self.close_all_peers().await;

        if self.signals.is_connected() {
            if let Err(e) = self.signals.send(ClientMessage::LeaveRoom {
                room_id: call.room.clone(),
            }) {
                debug!(room = %call.room, "leave-room not sent: {e}");
            }
        }
        info!(room = %call.room, "left call");
    }

    /// Mute or unmute the microphone without renegotiating. Returns the new
    /// enabled state, `None` outside a call or without an audio track.
    pub fn toggle_audio(&self) -> Option<bool> {
        self.call.as_ref()?.media.toggle(MediaKind::Audio)
    }

    pub fn toggle_video(&self) -> Option<bool> {
        self.call.as_ref()?.media.toggle(MediaKind::Video)
    }

    /// Feed one relay event into the call.
    pub async fn handle_relay_event(&mut self, event: RelayEvent) {
        self.reap_finished();

        match event {
            RelayEvent::Connected(id) => {
                self.local_session = Some(id.clone());
                self.emit(SessionEvent::RelayConnected(id));
                self.rejoin();
            }
            RelayEvent::Reconnected(id) => {
                self.local_session = Some(id.clone());
                self.emit(SessionEvent::RelayReconnected(id));
                self.rejoin();
            }
            RelayEvent::Disconnected => {
                // Peer connections cannot be resumed under a new session id.
                self.local_session = None;
                self.close_all_peers().await;
                self.emit(SessionEvent::RelayDisconnected);
            }
            RelayEvent::GaveUp => {
                self.local_session = None;
                self.close_all_peers().await;
                self.emit(SessionEvent::RelayGaveUp);
            }
            RelayEvent::Message(message) => self.on_server_event(message).await,
        }
    }

    async fn on_server_event(&mut self, event: ServerEvent) {
        if self.call.is_none() {
            debug!(event = event.event_name(), "not in a call, ignoring");
            return;
        }

        match event {
            ServerEvent::ExistingUsers(ids) => {
                for id in ids {
                    if self.is_self(&id) {
                        continue;
                    }
                    self.ensure_peer(id, Role::Initiator);
                }
            }
            ServerEvent::UserJoined(id) => {
                if !self.is_self(&id) {
                    self.ensure_peer(id, Role::Responder);
                }
            }
            ServerEvent::UserLeft(id) => {
                if let Some(handle) = self.peers.remove(&id) {
                    handle.shutdown(NegotiationEvent::PeerLeft).await;
                }
                self.emit(SessionEvent::PeerLeft(id));
            }
            ServerEvent::Signal(signal) => self.on_signal(signal),
        }
    }

    fn on_signal(&mut self, signal: ForwardedSignal) {
        let in_room = match (&signal.room_id, self.room()) {
            (Some(theirs), Some(ours)) => theirs == ours,
            _ => true,
        };
        if !in_room {
            debug!(sender = %signal.sender, "signal for another room dropped");
            return;
        }

        let event = match signal.kind {
            SignalKind::Offer => {
                self.ensure_peer(signal.sender.clone(), Role::Responder);
                NegotiationEvent::Offer(signal.payload)
            }
            SignalKind::Answer => NegotiationEvent::Answer(signal.payload),
            SignalKind::IceCandidate => NegotiationEvent::RemoteCandidate(signal.payload),
        };

        match self.peers.get(&signal.sender) {
            Some(handle) => {
                if !handle.send(event) {
                    debug!(sender = %signal.sender, "peer already torn down");
                }
            }
            None => debug!(
                sender = %signal.sender,
                kind = signal.kind.event_name(),
                "signal from unknown peer dropped"
            ),
        }
    }

    /// Spawn a negotiation task for `peer` unless a live one exists.
    fn ensure_peer(&mut self, peer: SessionId, role: Role) {
        if self.peers.get(&peer).is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Some(ctx) = self.peer_context() else {
            return;
        };

        debug!(peer = %peer, ?role, "starting negotiation");
        let handle = spawn_peer(&ctx, peer.clone(), role);
        handle.send(NegotiationEvent::Start);
        self.peers.insert(peer, handle);
    }

    fn peer_context(&self) -> Option<PeerContext<F, S>> {
        let call = self.call.as_ref()?;
        Some(PeerContext {
            factory: self.factory.clone(),
            signals: self.signals.clone(),
            media: call.media.clone(),
            room: call.room.clone(),
            events: self.events.clone(),
            connect_timeout: self.connect_timeout,
        })
    }

    fn send_join(&self) -> Result<(), TransportError> {
        let Some(call) = &self.call else {
            return Ok(());
        };
        if !self.signals.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.signals.send(ClientMessage::JoinRoom {
            room_id: call.room.clone(),
            user_id: self.user_id.clone(),
        })
    }

    fn rejoin(&self) {
        if self.call.is_none() {
            return;
        }
        if let Err(e) = self.send_join() {
            warn!("join-room not sent: {e}");
        }
    }

    async fn close_all_peers(&mut self) {
        for (_, handle) in self.peers.drain() {
            handle.shutdown(NegotiationEvent::Close).await;
        }
    }

    fn reap_finished(&mut self) {
        self.peers.retain(|_, handle| !handle.is_finished());
    }

    fn is_self(&self, id: &SessionId) -> bool {
        self.local_session.as_ref() == Some(id)
    }

    fn emit(&self, event: SessionEvent<RemoteTrackOf<F>>) {
        let _ = self.events.send(event);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::negotiation::tests::{Call, FakeFactory, RecordingSink};
    use crate::client::rtc::TransportEvent;
    use crate::error::CaptureError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct FakeCapture {
        fail_with: Option<fn() -> CaptureError>,
    }

    #[async_trait]
    impl MediaCapture for FakeCapture {
        async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, CaptureError> {
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(LocalMedia::new(constraints)),
            }
        }
    }

    /// `FakeFactory` shared with the test so transports can be inspected.
    #[derive(Clone, Default)]
    struct SharedFactory(Arc<FakeFactory>);

    #[async_trait]
    impl PeerFactory for SharedFactory {
        type Transport = <FakeFactory as PeerFactory>::Transport;

        async fn open(
            &self,
            peer: &SessionId,
            media: Arc<LocalMedia>,
            events: mpsc::UnboundedSender<TransportEvent<String>>,
        ) -> Result<Self::Transport, NegotiationError> {
            self.0.open(peer, media, events).await
        }
    }

    type Controller = SessionController<FakeCapture, SharedFactory, RecordingSink>;

    fn controller() -> (
        Controller,
        mpsc::UnboundedReceiver<SessionEvent<String>>,
        Arc<FakeFactory>,
        Arc<RecordingSink>,
    ) {
        let factory = SharedFactory::default();
        let inner = factory.0.clone();
        let sink = Arc::new(RecordingSink::connected());
        let (controller, events) = SessionController::new(
            FakeCapture { fail_with: None },
            factory,
            sink.clone(),
            &ClientConfig::default(),
        );
        (controller, events, inner, sink)
    }

    fn room() -> RoomId {
        RoomId::parse("room-1").unwrap()
    }

    async fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(v) = check() {
                    return v;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached")
    }

    fn signals_of(sink: &RecordingSink, kind: SignalKind) -> Vec<ClientMessage> {
        sink.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Signal { kind: k, .. } if *k == kind))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn join_generates_room_and_emits_join() {
        let (mut c, _events, _, sink) = controller();
        let room = c.join_call(None).await.unwrap();
        assert!(room.as_str().starts_with("ww-"));

        let sent = sink.take();
        assert_eq!(
            sent,
            vec![ClientMessage::JoinRoom {
                room_id: room.clone(),
                user_id: None
            }]
        );

        assert!(matches!(
            c.join_call(None).await,
            Err(SessionError::AlreadyInCall(r)) if r == room
        ));
    }

    #[tokio::test]
    async fn capture_failure_is_surfaced_without_joining() {
        let sink = Arc::new(RecordingSink::connected());
        let (mut c, _events) = SessionController::new(
            FakeCapture {
                fail_with: Some(|| CaptureError::InUse),
            },
            SharedFactory::default(),
            sink.clone(),
            &ClientConfig::default(),
        );

        let err = c.join_call(Some(room())).await.unwrap_err();
        assert!(matches!(err, SessionError::Capture(CaptureError::InUse)));
        assert_eq!(err.user_message(), "Camera or microphone is already in use");
        assert!(c.room().is_none());
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn join_waits_for_relay_connection() {
        let (mut c, _events, _, sink) = controller();
        sink.connected.store(false, Ordering::SeqCst);

        c.join_call(Some(room())).await.unwrap();
        assert!(sink.take().is_empty());

        sink.connected.store(true, Ordering::SeqCst);
        c.handle_relay_event(RelayEvent::Connected("A".into())).await;
        assert_eq!(
            sink.take(),
            vec![ClientMessage::JoinRoom {
                room_id: room(),
                user_id: None
            }]
        );
    }

    #[tokio::test]
    async fn existing_users_become_initiators() {
        let (mut c, _events, factory, sink) = controller();
        c.handle_relay_event(RelayEvent::Connected("A".into())).await;
        c.join_call(Some(room())).await.unwrap();

        c.handle_relay_event(RelayEvent::Message(ServerEvent::ExistingUsers(vec![
            "B".into(),
            "C".into(),
            "A".into(),
        ])))
        .await;
        assert_eq!(c.peer_ids(), vec![SessionId::from("B"), SessionId::from("C")]);

        let offers = wait_for(|| {
            let offers = signals_of(&sink, SignalKind::Offer);
            (offers.len() == 2).then_some(offers)
        })
        .await;
        let mut targets: Vec<_> = offers
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Signal { target, .. } => Some(target.to_string()),
                _ => None,
            })
            .collect();
        targets.sort();
        assert_eq!(targets, vec!["B", "C"]);
        assert!(factory.transport_for("A").is_none());
    }

    #[tokio::test]
    async fn incoming_offer_spawns_responder_and_answers() {
        let (mut c, _events, factory, sink) = controller();
        c.handle_relay_event(RelayEvent::Connected("A".into())).await;
        c.join_call(Some(room())).await.unwrap();

        c.handle_relay_event(RelayEvent::Message(ServerEvent::Signal(ForwardedSignal {
            kind: SignalKind::Offer,
            sender: "B".into(),
            room_id: Some(room()),
            payload: json!({ "type": "offer", "sdp": "v=0 remote" }),
        })))
        .await;

        let answers = wait_for(|| {
            let answers = signals_of(&sink, SignalKind::Answer);
            (!answers.is_empty()).then_some(answers)
        })
        .await;
        assert!(matches!(
            &answers[0],
            ClientMessage::Signal { target, payload, .. }
                if target.as_str() == "B" && payload["type"] == "answer"
        ));

        let transport = factory.transport_for("B").unwrap();
        assert_eq!(
            transport.calls()[0],
            Call::SetRemote(crate::protocol::SdpType::Offer, "v=0 remote".into())
        );
    }

    #[tokio::test]
    async fn signals_for_another_room_are_dropped() {
        let (mut c, _events, factory, _sink) = controller();
        c.join_call(Some(room())).await.unwrap();

        c.handle_relay_event(RelayEvent::Message(ServerEvent::Signal(ForwardedSignal {
            kind: SignalKind::Offer,
            sender: "B".into(),
            room_id: RoomId::parse("room-2"),
            payload: json!({ "type": "offer", "sdp": "v=0" }),
        })))
        .await;
        assert!(c.peer_ids().is_empty());
        assert!(factory.transport_for("B").is_none());
    }

    #[tokio::test]
    async fn user_left_closes_that_peer_only() {
        let (mut c, mut events, factory, _sink) = controller();
        c.handle_relay_event(RelayEvent::Connected("A".into())).await;
        c.join_call(Some(room())).await.unwrap();
        c.handle_relay_event(RelayEvent::Message(ServerEvent::ExistingUsers(vec![
            "B".into(),
            "C".into(),
        ])))
        .await;

        c.handle_relay_event(RelayEvent::Message(ServerEvent::UserLeft("B".into())))
            .await;
        assert_eq!(c.peer_ids(), vec![SessionId::from("C")]);
        assert_eq!(
            factory.transport_for("B").unwrap().calls().last(),
            Some(&Call::Close)
        );
        let c_transport = wait_for(|| factory.transport_for("C")).await;
        assert!(!c_transport.calls().contains(&Call::Close));

        let mut saw_closed = false;
        let mut saw_left = false;
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::PeerPhase { peer, phase: Phase::Closed } if peer.as_str() == "B" => {
                    saw_closed = true
                }
                SessionEvent::PeerLeft(peer) if peer.as_str() == "B" => saw_left = true,
                _ => {}
            }
        }
        assert!(saw_closed && saw_left);
    }

    #[tokio::test]
    async fn one_failed_peer_does_not_affect_others() {
        let (mut c, mut events, factory, _sink) = controller();
        c.handle_relay_event(RelayEvent::Connected("A".into())).await;
        c.join_call(Some(room())).await.unwrap();
        c.handle_relay_event(RelayEvent::Message(ServerEvent::ExistingUsers(vec![
            "B".into(),
            "C".into(),
        ])))
        .await;
        wait_for(|| factory.transport_for("C").map(|_| ())).await;

        c.handle_relay_event(RelayEvent::Message(ServerEvent::Signal(ForwardedSignal {
            kind: SignalKind::Answer,
            sender: "B".into(),
            room_id: Some(room()),
            payload: json!({ "type": "answer", "sdp": "bad" }),
        })))
        .await;

        let failed = wait_for(|| match events.try_recv() {
            Ok(SessionEvent::PeerFailed { peer, error }) => Some((peer, error)),
            _ => None,
        })
        .await;
        assert_eq!(failed.0.as_str(), "B");
        assert_eq!(failed.1.user_message(), "Connection failed");

        let c_transport = factory.transport_for("C").unwrap();
        assert!(!c_transport.calls().contains(&Call::Close));
        assert!(c.peer_ids().contains(&SessionId::from("C")));
    }

    #[tokio::test]
    async fn leave_stops_tracks_closes_peers_and_is_idempotent() {
        let (mut c, _events, factory, sink) = controller();
        c.handle_relay_event(RelayEvent::Connected("A".into())).await;
        c.join_call(Some(room())).await.unwrap();
        c.handle_relay_event(RelayEvent::Message(ServerEvent::ExistingUsers(vec![
            "B".into(),
        ])))
        .await;
        let media = c.local_media().unwrap().clone();

        c.leave_call().await;
        assert!(!media.any_live());
        assert!(c.peer_ids().is_empty());
        assert!(c.room().is_none());
        assert_eq!(
            factory.transport_for("B").unwrap().calls().last(),
            Some(&Call::Close)
        );
        assert!(sink
            .take()
            .contains(&ClientMessage::LeaveRoom { room_id: room() }));

        c.leave_call().await;
        assert!(sink.take().is_empty());

        // A late answer after leaving is a no-op.
        c.handle_relay_event(RelayEvent::Message(ServerEvent::Signal(ForwardedSignal {
            kind: SignalKind::Answer,
            sender: "B".into(),
            room_id: Some(room()),
            payload: json!({ "type": "answer", "sdp": "v=0" }),
        })))
        .await;
        assert!(!factory
            .transport_for("B")
            .unwrap()
            .calls()
            .iter()
            .any(|call| matches!(call, Call::SetRemote(..))));
    }

    #[tokio::test]
    async fn toggles_flip_tracks_without_signalling() {
        let (mut c, _events, _, sink) = controller();
        assert_eq!(c.toggle_audio(), None);

        c.join_call(Some(room())).await.unwrap();
        sink.take();

        assert_eq!(c.toggle_audio(), Some(false));
        assert_eq!(c.toggle_video(), Some(false));
        assert_eq!(c.toggle_video(), Some(true));
        let media = c.local_media().unwrap();
        assert!(media.tracks_of(MediaKind::Audio).all(|t| !t.is_enabled()));
        assert!(media.tracks_of(MediaKind::Video).all(|t| t.is_enabled()));
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn relay_loss_tears_down_peers_and_rejoins_on_reconnect() {
        let (mut c, _events, factory, sink) = controller();
        c.handle_relay_event(RelayEvent::Connected("A".into())).await;
        c.join_call(Some(room())).await.unwrap();
        c.handle_relay_event(RelayEvent::Message(ServerEvent::ExistingUsers(vec![
            "B".into(),
        ])))
        .await;

        c.handle_relay_event(RelayEvent::Disconnected).await;
        sink.take();
        assert!(c.peer_ids().is_empty());
        assert_eq!(
            factory.transport_for("B").unwrap().calls().last(),
            Some(&Call::Close)
        );
        assert_eq!(c.room(), Some(&room()));

        c.handle_relay_event(RelayEvent::Reconnected("A2".into())).await;
        assert_eq!(
            sink.take(),
            vec![ClientMessage::JoinRoom {
                room_id: room(),
                user_id: None
            }]
        );
    }

    #[tokio::test]
    async fn events_outside_a_call_are_ignored() {
        let (mut c, _events, factory, _sink) = controller();
        c.handle_relay_event(RelayEvent::Message(ServerEvent::UserJoined("B".into())))
            .await;
        assert!(c.peer_ids().is_empty());
        assert!(factory.transport_for("B").is_none());
    }
}
