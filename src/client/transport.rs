use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::protocol::{ClientMessage, ServerEvent, SessionId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Outbound seam ──────────────────────────────────────────────────────────

/// Where the client side sends its relay messages.
pub trait SignalSink: Send + Sync + 'static {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

// ─── Engine.IO / Socket.IO framing ──────────────────────────────────────────

const PACKET_PONG: &str = "3";
const PACKET_CONNECT: &str = "40";
const PACKET_DISCONNECT: &str = "41";

/// One decoded text frame from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Open {
        ping_interval: Duration,
        ping_timeout: Duration,
    },
    Close,
    Ping,
    Pong,
    Noop,
    Connected(SessionId),
    Disconnected,
    ConnectError(String),
    Event { name: String, payload: Value },
}

/// Encode an event on the default namespace: `42["name", payload]`.
pub fn encode_event(name: &str, payload: &Value) -> String {
    let frame = Value::Array(vec![Value::String(name.to_owned()), payload.clone()]);
    format!("42{frame}")
}

pub fn decode_frame(frame: &str) -> Option<Inbound> {
    let mut chars = frame.chars();
    let engine_type = chars.next()?;
    let rest = chars.as_str();

    match engine_type {
        '0' => {
            let open: Value = serde_json::from_str(rest).ok()?;
            let millis = |key: &str, default: u64| {
                Duration::from_millis(open.get(key).and_then(Value::as_u64).unwrap_or(default))
            };
            Some(Inbound::Open {
                ping_interval: millis("pingInterval", 25_000),
                ping_timeout: millis("pingTimeout", 20_000),
            })
        }
        '1' => Some(Inbound::Close),
        '2' => Some(Inbound::Ping),
        '3' => Some(Inbound::Pong),
        '6' => Some(Inbound::Noop),
        '4' => decode_socket_packet(rest),
        _ => None,
    }
}

fn decode_socket_packet(packet: &str) -> Option<Inbound> {
    let mut chars = packet.chars();
    let packet_type = chars.next()?;
    let body = strip_namespace(chars.as_str());

    match packet_type {
        '0' => {
            let ack: Value = serde_json::from_str(body).ok()?;
            let sid = ack.get("sid")?.as_str()?;
            Some(Inbound::Connected(SessionId::from(sid)))
        }
        '1' => Some(Inbound::Disconnected),
        '2' => {
            // Skip an optional ack id before the JSON array.
            let body = body.trim_start_matches(|c: char| c.is_ascii_digit());
            let mut items: Vec<Value> = serde_json::from_str(body).ok()?;
            if items.is_empty() {
                return None;
            }
            let name = items.remove(0).as_str()?.to_owned();
            let payload = match items.len() {
                0 => Value::Null,
                1 => items.remove(0),
                _ => Value::Array(items),
            };
            Some(Inbound::Event { name, payload })
        }
        '4' => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_owned))
                .unwrap_or_else(|| body.to_owned());
            Some(Inbound::ConnectError(message))
        }
        _ => None,
    }
}

/// Drop a `/nsp,` prefix if present.
fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(idx) => &body[idx + 1..],
            None => "",
        }
    } else {
        body
    }
}

/// Turn the configured relay address into the Socket.IO websocket endpoint.
pub fn websocket_url(base: &str) -> Result<String, TransportError> {
    let base = base.trim().trim_end_matches('/');
    let (scheme, rest) = base
        .split_once("://")
        .ok_or_else(|| TransportError::InvalidUrl(base.to_owned()))?;
    let scheme = match scheme {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(TransportError::InvalidUrl(base.to_owned())),
    };
    if rest.is_empty() {
        return Err(TransportError::InvalidUrl(base.to_owned()));
    }
    Ok(format!("{scheme}://{rest}/socket.io/?EIO=4&transport=websocket"))
}

// ─── Relay client ───────────────────────────────────────────────────────────

/// What the relay connection reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected(SessionId),
    Reconnected(SessionId),
    Disconnected,
    Message(ServerEvent),
    /// Reconnection attempts exhausted; nothing more will arrive.
    GaveUp,
}

struct Link {
    frames: mpsc::UnboundedSender<String>,
    session: SessionId,
}

#[derive(Default)]
struct Shared {
    link: Mutex<Option<Link>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Socket.IO client for the relay with bounded reconnection.
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl RelayClient {
    /// Start connecting in the background. Connection state arrives on the
    /// returned channel as [`RelayEvent`]s.
    pub fn connect(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>), TransportError> {
        let url = websocket_url(&config.signaling_url)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let client = Self {
            shared: Arc::new(Shared::default()),
            cancel: CancellationToken::new(),
        };

        let supervisor = Supervisor {
            url,
            attempts: config.reconnect_attempts,
            delay: config.reconnect_delay,
            shared: client.shared.clone(),
            events: events_tx,
            cancel: client.cancel.clone(),
        };
        tokio::spawn(supervisor.run());

        Ok((client, events_rx))
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.lock().as_ref().map(|l| l.session.clone())
    }

    /// Disconnect and stop reconnecting.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl SignalSink for RelayClient {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let frame = encode_event(message.event_name(), &message.payload());
        let guard = self.shared.lock();
        let link = guard.as_ref().ok_or(TransportError::NotConnected)?;
        link.frames
            .send(frame)
            .map_err(|_| TransportError::NotConnected)
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().is_some()
    }
}

enum ConnectionEnd {
    Lost,
    Cancelled,
}

struct Supervisor {
    url: String,
    attempts: u32,
    delay: Duration,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<RelayEvent>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let mut ever_connected = false;
        let mut failures = 0u32;

        loop {
            // connection() owns cancellation so queued frames are flushed.
            match self.connection(ever_connected).await {
                Ok(ConnectionEnd::Cancelled) => break,
                Ok(ConnectionEnd::Lost) => {
                    ever_connected = true;
                    failures = 0;
                    warn!("Relay connection lost");
                    let _ = self.events.send(RelayEvent::Disconnected);
                }
                Err(e) => {
                    failures += 1;
                    warn!(attempt = failures, max = self.attempts, "Relay connection failed: {e}");
                }
            }

            if failures >= self.attempts {
                warn!("Giving up on the relay after {failures} failed attempt(s)");
                let _ = self.events.send(RelayEvent::GaveUp);
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        self.shared.lock().take();
        debug!("Relay supervisor terminated");
    }

    async fn connection(&self, reconnect: bool) -> Result<ConnectionEnd, TransportError> {
        info!(url = %self.url, "Connecting to relay");
        let handshake = async {
            let (ws, _) = connect_async(self.url.as_str()).await?;
            let (mut write, mut read) = ws.split();

            let window = match decode_frame(&next_text(&mut read).await?) {
                Some(Inbound::Open {
                    ping_interval,
                    ping_timeout,
                }) => ping_interval + ping_timeout,
                other => {
                    return Err(TransportError::Handshake(format!(
                        "expected open packet, got {other:?}"
                    )))
                }
            };

            write.send(Message::Text(PACKET_CONNECT.into())).await?;
            let session = loop {
                match decode_frame(&next_text(&mut read).await?) {
                    Some(Inbound::Connected(sid)) => break sid,
                    Some(Inbound::Ping) => write.send(Message::Text(PACKET_PONG.into())).await?,
                    Some(Inbound::ConnectError(e)) => return Err(TransportError::Handshake(e)),
                    _ => continue,
                }
            };
            Ok::<_, TransportError>((write, read, window, session))
        };

        let (mut write, mut read, window, session) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(ConnectionEnd::Cancelled),
            result = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake) => {
                result.map_err(|_| TransportError::Handshake("timed out".into()))??
            }
        };

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
        *self.shared.lock() = Some(Link {
            frames: frames_tx,
            session: session.clone(),
        });
        info!(session = %session, "Connected to relay");
        let _ = self.events.send(if reconnect {
            RelayEvent::Reconnected(session)
        } else {
            RelayEvent::Connected(session)
        });

        let mut last_seen = Instant::now();
        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Frames queued before close() (e.g. leave-room) go out first.
                    while let Ok(frame) = frames_rx.try_recv() {
                        if write.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    let _ = write.send(Message::Text(PACKET_DISCONNECT.into())).await;
                    let _ = write.close().await;
                    break ConnectionEnd::Cancelled;
                }
                Some(frame) = frames_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        warn!("Failed to send to relay: {e}");
                        break ConnectionEnd::Lost;
                    }
                }
                _ = tokio::time::sleep_until(last_seen + window) => {
                    warn!("Relay heartbeat timed out");
                    break ConnectionEnd::Lost;
                }
                message = read.next() => {
                    last_seen = Instant::now();
                    match message {
                        Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                            Some(Inbound::Ping) => {
                                if write.send(Message::Text(PACKET_PONG.into())).await.is_err() {
                                    break ConnectionEnd::Lost;
                                }
                            }
                            Some(Inbound::Event { name, payload }) => {
                                match ServerEvent::from_wire(&name, &payload) {
                                    Some(event) => {
                                        let _ = self.events.send(RelayEvent::Message(event));
                                    }
                                    None => debug!(event = %name, "unhandled relay event"),
                                }
                            }
                            Some(Inbound::Close | Inbound::Disconnected) => break ConnectionEnd::Lost,
                            _ => {}
                        },
                        Some(Ok(Message::Close(_))) | None => break ConnectionEnd::Lost,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Relay websocket error: {e}");
                            break ConnectionEnd::Lost;
                        }
                    }
                }
            }
        };

        self.shared.lock().take();
        Ok(end)
    }
}

async fn next_text(
    read: &mut futures::stream::SplitStream<WsStream>,
) -> Result<String, TransportError> {
    while let Some(message) = read.next().await {
        match message? {
            Message::Text(text) => return Ok(text),
            Message::Close(_) => return Err(TransportError::Closed),
            _ => continue,
        }
    }
    Err(TransportError::Closed)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
