use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::media::LocalMedia;
use crate::client::rtc::{PeerFactory, PeerTransport, RemoteTrackOf, TransportEvent, TransportState};
use crate::client::session::SessionEvent;
use crate::client::transport::SignalSink;
use crate::error::NegotiationError;
use crate::protocol::{
    ClientMessage, IceCandidate, RoomId, SdpType, SessionDescription, SessionId, SignalKind,
};

// ─── Phases ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Handshake phase of one peer connection. `Closed` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    LocalDescriptionSet,
    AwaitingOffer,
    RemoteDescriptionSet,
    Connected,
    Closed,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    fn has_remote_description(&self) -> bool {
        matches!(self, Self::RemoteDescriptionSet | Self::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::LocalDescriptionSet => "local-description-set",
            Self::AwaitingOffer => "awaiting-offer",
            Self::RemoteDescriptionSet => "remote-description-set",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Events and effects ─────────────────────────────────────────────────────

/// Everything that can move a peer connection forward. Relay payloads are
/// carried raw and only parsed here.
#[derive(Debug)]
pub enum NegotiationEvent<R> {
    Start,
    Offer(Value),
    Answer(Value),
    RemoteCandidate(Value),
    Transport(TransportEvent<R>),
    PeerLeft,
    Close,
    TimedOut(Duration),
}

#[derive(Debug)]
pub enum Effect<R> {
    /// Send to the remote peer through the relay.
    Signal { kind: SignalKind, payload: Value },
    Phase(Phase),
    RemoteTrack(R),
    Failed(NegotiationError),
}

// ─── State machine ──────────────────────────────────────────────────────────

/// Handshake state for one remote peer. `handle` is the only transition
/// function; it consumes one event at a time.
pub struct PeerNegotiation<T: PeerTransport> {
    peer: SessionId,
    role: Role,
    phase: Phase,
    transport: T,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: VecDeque<IceCandidate>,
    /// Remote tracks are surfaced once connectivity is established.
    pending_tracks: Vec<T::RemoteTrack>,
}

impl<T: PeerTransport> PeerNegotiation<T> {
    pub fn new(peer: SessionId, role: Role, transport: T) -> Self {
        Self {
            peer,
            role,
            phase: Phase::Idle,
            transport,
            pending_candidates: VecDeque::new(),
            pending_tracks: Vec::new(),
        }
    }

    pub fn peer(&self) -> &SessionId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn handle(
        &mut self,
        event: NegotiationEvent<T::RemoteTrack>,
    ) -> Vec<Effect<T::RemoteTrack>> {
        let mut effects = Vec::new();
        if self.phase.is_terminal() {
            debug!(peer = %self.peer, phase = %self.phase, "event after teardown ignored");
            return effects;
        }

        let result = match event {
            NegotiationEvent::Start => self.start(&mut effects).await,
            NegotiationEvent::Offer(payload) => self.on_offer(payload, &mut effects).await,
            NegotiationEvent::Answer(payload) => self.on_answer(payload, &mut effects).await,
            NegotiationEvent::RemoteCandidate(payload) => self.on_remote_candidate(payload).await,
            NegotiationEvent::Transport(event) => self.on_transport(event, &mut effects).await,
            NegotiationEvent::PeerLeft | NegotiationEvent::Close => {
                self.shutdown(&mut effects).await;
                Ok(())
            }
            NegotiationEvent::TimedOut(limit) if self.phase != Phase::Connected => {
                Err(NegotiationError::TimedOut(limit))
            }
            NegotiationEvent::TimedOut(_) => Ok(()),
        };

        if let Err(err) = result {
            self.fail(err, &mut effects).await;
        }
        effects
    }

    async fn start(&mut self, effects: &mut Vec<Effect<T::RemoteTrack>>) -> Result<(), NegotiationError> {
        match (self.role, self.phase) {
            (Role::Initiator, Phase::Idle) => {
                let offer = self.transport.create_offer().await?;
                effects.push(Effect::Signal {
                    kind: SignalKind::Offer,
                    payload: offer.to_value(),
                });
                self.set_phase(Phase::LocalDescriptionSet, effects);
            }
            (Role::Responder, Phase::Idle) => self.set_phase(Phase::AwaitingOffer, effects),
            _ => debug!(peer = %self.peer, phase = %self.phase, "already started"),
        }
        Ok(())
    }

    async fn on_offer(
        &mut self,
        payload: Value,
        effects: &mut Vec<Effect<T::RemoteTrack>>,
    ) -> Result<(), NegotiationError> {
        if self.role != Role::Responder || !matches!(self.phase, Phase::Idle | Phase::AwaitingOffer)
        {
            warn!(peer = %self.peer, phase = %self.phase, "unexpected offer ignored");
            return Ok(());
        }

        let offer = parse_description(payload, SdpType::Offer)?;
        self.transport.set_remote_description(offer).await?;
        self.flush_candidates().await?;

        let answer = self.transport.create_answer().await?;
        effects.push(Effect::Signal {
            kind: SignalKind::Answer,
            payload: answer.to_value(),
        });
        self.set_phase(Phase::RemoteDescriptionSet, effects);
        Ok(())
    }

    async fn on_answer(
        &mut self,
        payload: Value,
        effects: &mut Vec<Effect<T::RemoteTrack>>,
    ) -> Result<(), NegotiationError> {
        if self.role != Role::Initiator || self.phase != Phase::LocalDescriptionSet {
            warn!(peer = %self.peer, phase = %self.phase, "unexpected answer ignored");
            return Ok(());
        }

        let answer = parse_description(payload, SdpType::Answer)?;
        self.transport.set_remote_description(answer).await?;
        self.set_phase(Phase::RemoteDescriptionSet, effects);
        self.flush_candidates().await
    }

    async fn on_remote_candidate(&mut self, payload: Value) -> Result<(), NegotiationError> {
        if payload.is_null() {
            return Ok(());
        }
        let candidate: IceCandidate = serde_json::from_value(payload)
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))?;
        // Empty candidate string is the end-of-candidates marker.
        if candidate.candidate.is_empty() {
            return Ok(());
        }

        if self.phase.has_remote_description() {
            self.transport.add_ice_candidate(candidate).await
        } else {
            self.pending_candidates.push_back(candidate);
            debug!(
                peer = %self.peer,
                queued = self.pending_candidates.len(),
                "remote description not set yet, queuing candidate"
            );
            Ok(())
        }
    }

    async fn flush_candidates(&mut self) -> Result<(), NegotiationError> {
        if !self.pending_candidates.is_empty() {
            debug!(
                peer = %self.peer,
                count = self.pending_candidates.len(),
                "applying pending candidates"
            );
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn on_transport(
        &mut self,
        event: TransportEvent<T::RemoteTrack>,
        effects: &mut Vec<Effect<T::RemoteTrack>>,
    ) -> Result<(), NegotiationError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let payload = serde_json::to_value(&candidate)
                    .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))?;
                effects.push(Effect::Signal {
                    kind: SignalKind::IceCandidate,
                    payload,
                });
            }
            TransportEvent::StateChanged(TransportState::Connected) => {
                if self.phase == Phase::RemoteDescriptionSet {
                    self.set_phase(Phase::Connected, effects);
                    effects.extend(self.pending_tracks.drain(..).map(Effect::RemoteTrack));
                }
            }
            TransportEvent::StateChanged(TransportState::Failed) => {
                return Err(NegotiationError::ConnectivityFailed);
            }
            TransportEvent::StateChanged(TransportState::Closed) => self.shutdown(effects).await,
            TransportEvent::StateChanged(state) => {
                debug!(peer = %self.peer, ?state, "transport state");
            }
            TransportEvent::RemoteTrack(track) => {
                if self.phase == Phase::Connected {
                    effects.push(Effect::RemoteTrack(track));
                } else {
                    self.pending_tracks.push(track);
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self, effects: &mut Vec<Effect<T::RemoteTrack>>) {
        if let Err(e) = self.transport.close().await {
            warn!(peer = %self.peer, "Failed to close peer connection: {e}");
        }
        self.pending_candidates.clear();
        self.pending_tracks.clear();
        self.set_phase(Phase::Closed, effects);
    }

    async fn fail(&mut self, err: NegotiationError, effects: &mut Vec<Effect<T::RemoteTrack>>) {
        warn!(peer = %self.peer, phase = %self.phase, "negotiation failed: {err}");
        if let Err(e) = self.transport.close().await {
            debug!(peer = %self.peer, "close after failure: {e}");
        }
        self.pending_candidates.clear();
        self.pending_tracks.clear();
        self.set_phase(Phase::Failed, effects);
        effects.push(Effect::Failed(err));
    }

    fn set_phase(&mut self, phase: Phase, effects: &mut Vec<Effect<T::RemoteTrack>>) {
        if self.phase == phase {
            return;
        }
        info!(peer = %self.peer, from = %self.phase, to = %phase, "phase");
        self.phase = phase;
        effects.push(Effect::Phase(phase));
    }
}

fn parse_description(payload: Value, expected: SdpType) -> Result<SessionDescription, NegotiationError> {
    let description: SessionDescription = serde_json::from_value(payload)
        .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?;
    if description.sdp_type != expected {
        return Err(NegotiationError::InvalidDescription(format!(
            "expected {expected:?}, got {:?}",
            description.sdp_type
        )));
    }
    Ok(description)
}

// ─── Per-peer task ──────────────────────────────────────────────────────────

/// Shared inputs for every negotiation task of one call.
pub struct PeerContext<F: PeerFactory, S: SignalSink> {
    pub factory: Arc<F>,
    pub signals: Arc<S>,
    pub media: Arc<LocalMedia>,
    pub room: RoomId,
    pub events: mpsc::UnboundedSender<SessionEvent<RemoteTrackOf<F>>>,
    pub connect_timeout: Option<Duration>,
}

impl<F: PeerFactory, S: SignalSink> Clone for PeerContext<F, S> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            signals: self.signals.clone(),
            media: self.media.clone(),
            room: self.room.clone(),
            events: self.events.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Owner's end of a running negotiation task.
pub struct PeerHandle<R> {
    peer: SessionId,
    role: Role,
    commands: mpsc::UnboundedSender<NegotiationEvent<R>>,
    task: JoinHandle<()>,
}

impl<R: Send + 'static> PeerHandle<R> {
    pub fn peer(&self) -> &SessionId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queue an event. Returns false once the task has ended.
    pub fn send(&self, event: NegotiationEvent<R>) -> bool {
        self.commands.send(event).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Deliver a final event and wait for the task to exit. No callback from
    /// this peer fires after this returns.
    pub async fn shutdown(self, event: NegotiationEvent<R>) {
        let _ = self.commands.send(event);
        if let Err(e) = self.task.await {
            warn!(peer = %self.peer, "negotiation task ended abnormally: {e}");
        }
    }
}

/// Start the task that owns one peer's state machine. Commands, transport
/// callbacks and the optional connect deadline are consumed strictly one at
/// a time.
pub fn spawn_peer<F, S>(
    ctx: &PeerContext<F, S>,
    peer: SessionId,
    role: Role,
) -> PeerHandle<RemoteTrackOf<F>>
where
    F: PeerFactory,
    S: SignalSink,
{
    let (commands, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_peer(ctx.clone(), peer.clone(), role, rx));
    PeerHandle {
        peer,
        role,
        commands,
        task,
    }
}

async fn run_peer<F, S>(
    ctx: PeerContext<F, S>,
    peer: SessionId,
    role: Role,
    mut commands: mpsc::UnboundedReceiver<NegotiationEvent<RemoteTrackOf<F>>>,
) where
    F: PeerFactory,
    S: SignalSink,
{
    let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
    let transport = match ctx.factory.open(&peer, ctx.media.clone(), transport_tx).await {
        Ok(transport) => transport,
        Err(error) => {
            warn!(peer = %peer, "Failed to open peer connection: {error}");
            let _ = ctx.events.send(SessionEvent::PeerPhase {
                peer: peer.clone(),
                phase: Phase::Failed,
            });
            let _ = ctx.events.send(SessionEvent::PeerFailed { peer, error });
            return;
        }
    };

    let mut machine = PeerNegotiation::new(peer.clone(), role, transport);
    let mut deadline = ctx
        .connect_timeout
        .map(|limit| (Instant::now() + limit, limit));

    loop {
        let event = tokio::select! {
            command = commands.recv() => command.unwrap_or(NegotiationEvent::Close),
            Some(event) = transport_rx.recv() => NegotiationEvent::Transport(event),
            limit = expire(deadline) => {
                deadline = None;
                NegotiationEvent::TimedOut(limit)
            }
        };

        for effect in machine.handle(event).await {
            dispatch(&ctx, &peer, effect);
        }

        match machine.phase() {
            phase if phase.is_terminal() => break,
            Phase::Connected => deadline = None,
            _ => {}
        }
    }

    debug!(peer = %peer, phase = %machine.phase(), "negotiation task finished");
}

fn dispatch<F, S>(ctx: &PeerContext<F, S>, peer: &SessionId, effect: Effect<RemoteTrackOf<F>>)
where
    F: PeerFactory,
    S: SignalSink,
{
    let event = match effect {
        Effect::Signal { kind, payload } => {
            let message = ClientMessage::Signal {
                kind,
                target: peer.clone(),
                room_id: ctx.room.clone(),
                payload,
            };
            if let Err(e) = ctx.signals.send(message) {
                warn!(peer = %peer, kind = kind.event_name(), "signal not sent: {e}");
            }
            return;
        }
        Effect::Phase(phase) => SessionEvent::PeerPhase {
            peer: peer.clone(),
            phase,
        },
        Effect::RemoteTrack(track) => SessionEvent::RemoteStream {
            peer: peer.clone(),
            track,
        },
        Effect::Failed(error) => SessionEvent::PeerFailed {
            peer: peer.clone(),
            error,
        },
    };
    let _ = ctx.events.send(event);
}

async fn expire(deadline: Option<(Instant, Duration)>) -> Duration {
    match deadline {
        Some((at, limit)) => {
            tokio::time::sleep_until(at).await;
            limit
        }
        None => std::future::pending().await,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
