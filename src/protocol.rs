use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque, connection-scoped identifier assigned by the transport on connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Log-safe form: `masked-` plus the first six characters.
    pub fn masked(&self) -> String {
        let prefix: String = self.0.chars().take(6).collect();
        format!("masked-{prefix}")
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Shareable room token. Always safe to embed in a URL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

const ROOM_ID_PREFIX: &str = "ww-";
const ROOM_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ROOM_ID_RANDOM_LEN: usize = 8;
const ROOM_ID_MAX_LEN: usize = 64;

impl RoomId {
    /// Validate a client-supplied token: 1..=64 ASCII alphanumerics, `-` or `_`.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= ROOM_ID_MAX_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| Self(raw.to_string()))
    }

    /// Generate a fresh `ww-xxxxxxxx` token.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut id = String::with_capacity(ROOM_ID_PREFIX.len() + ROOM_ID_RANDOM_LEN);
        id.push_str(ROOM_ID_PREFIX);
        for _ in 0..ROOM_ID_RANDOM_LEN {
            let idx = rng.gen_range(0..ROOM_ID_ALPHABET.len());
            id.push(ROOM_ID_ALPHABET[idx] as char);
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RoomId::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid room id '{raw}'")))
    }
}

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub const EVENT_JOIN_ROOM: &str = "join-room";
pub const EVENT_LEAVE_ROOM: &str = "leave-room";
pub const EVENT_EXISTING_USERS: &str = "existing-users";
pub const EVENT_USER_JOINED: &str = "user-joined";
pub const EVENT_USER_LEFT: &str = "user-left";
pub const EVENT_OFFER: &str = "offer";
pub const EVENT_ANSWER: &str = "answer";
pub const EVENT_ICE_CANDIDATE: &str = "ice-candidate";

/// The three negotiation messages the relay forwards without inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [Self::Offer, Self::Answer, Self::IceCandidate];

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Offer => EVENT_OFFER,
            Self::Answer => EVENT_ANSWER,
            Self::IceCandidate => EVENT_ICE_CANDIDATE,
        }
    }

    /// Name of the JSON field that carries the opaque payload.
    pub fn payload_field(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "candidate",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.event_name() == name)
    }
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub room_id: RoomId,
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinObject {
    room_id: String,
    #[serde(default)]
    user_id: Option<String>,
}

impl JoinRequest {
    /// Accepts `"room"`, `["room", "user"?]` or `{roomId, userId?}`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let (room, user) = match value {
            Value::String(room) => (room.clone(), None),
            Value::Array(args) => {
                let room = args.first()?.as_str()?.to_string();
                let user = args.get(1).and_then(Value::as_str).map(str::to_string);
                (room, user)
            }
            Value::Object(_) => {
                let obj: JoinObject = serde_json::from_value(value.clone()).ok()?;
                (obj.room_id, obj.user_id)
            }
            _ => return None,
        };
        Some(Self {
            room_id: RoomId::parse(&room)?,
            user_id: user.filter(|u| !u.is_empty()),
        })
    }
}

/// Parse the room id carried by `leave-room` (bare string or `{roomId}`).
pub fn parse_leave(value: &Value) -> Option<RoomId> {
    match value {
        Value::String(room) => RoomId::parse(room),
        Value::Array(args) => RoomId::parse(args.first()?.as_str()?),
        Value::Object(obj) => RoomId::parse(obj.get("roomId")?.as_str()?),
        _ => None,
    }
}

/// An inbound offer/answer/ice-candidate. Only `target` and `roomId` are
/// structurally meaningful; the payload stays opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRequest {
    pub kind: SignalKind,
    pub target: SessionId,
    pub room_id: Option<RoomId>,
    pub payload: Value,
}

impl SignalRequest {
    pub fn from_value(kind: SignalKind, value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let target = obj.get("target")?.as_str().filter(|t| !t.is_empty())?;
        let payload = obj.get(kind.payload_field())?.clone();
        let room_id = obj
            .get("roomId")
            .and_then(Value::as_str)
            .and_then(RoomId::parse);
        Some(Self {
            kind,
            target: SessionId::from(target),
            room_id,
            payload,
        })
    }
}

/// Everything a client sends to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
        user_id: Option<String>,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    Signal {
        kind: SignalKind,
        target: SessionId,
        room_id: RoomId,
        payload: Value,
    },
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => EVENT_JOIN_ROOM,
            Self::LeaveRoom { .. } => EVENT_LEAVE_ROOM,
            Self::Signal { kind, .. } => kind.event_name(),
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::JoinRoom { room_id, user_id } => match user_id {
                Some(user) => json!({ "roomId": room_id, "userId": user }),
                None => json!(room_id),
            },
            Self::LeaveRoom { room_id } => json!(room_id),
            Self::Signal {
                kind,
                target,
                room_id,
                payload,
            } => {
                let mut obj = serde_json::Map::new();
                obj.insert("target".into(), json!(target));
                obj.insert(kind.payload_field().into(), payload.clone());
                obj.insert("roomId".into(), json!(room_id));
                Value::Object(obj)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// A negotiation message after the relay stamped the sender on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedSignal {
    pub kind: SignalKind,
    pub sender: SessionId,
    pub room_id: Option<RoomId>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ExistingUsers(Vec<SessionId>),
    UserJoined(SessionId),
    UserLeft(SessionId),
    Signal(ForwardedSignal),
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ExistingUsers(_) => EVENT_EXISTING_USERS,
            Self::UserJoined(_) => EVENT_USER_JOINED,
            Self::UserLeft(_) => EVENT_USER_LEFT,
            Self::Signal(signal) => signal.kind.event_name(),
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::ExistingUsers(ids) => json!(ids),
            Self::UserJoined(id) | Self::UserLeft(id) => json!(id),
            Self::Signal(signal) => {
                let mut obj = serde_json::Map::new();
                obj.insert("sender".into(), json!(signal.sender));
                obj.insert(signal.kind.payload_field().into(), signal.payload.clone());
                obj.insert(
                    "roomId".into(),
                    signal.room_id.as_ref().map_or(Value::Null, |r| json!(r)),
                );
                Value::Object(obj)
            }
        }
    }

    /// Decode an event received by a client. Unknown or malformed events yield `None`.
    pub fn from_wire(event: &str, payload: &Value) -> Option<Self> {
        match event {
            EVENT_EXISTING_USERS => {
                // A lone id or no argument at all also show up when a server
                // spreads the list into event arguments.
                let ids = match payload {
                    Value::Array(items) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(SessionId::from)
                        .collect(),
                    Value::String(id) => vec![SessionId::from(id.as_str())],
                    Value::Null => Vec::new(),
                    _ => return None,
                };
                Some(Self::ExistingUsers(ids))
            }
            EVENT_USER_JOINED => Some(Self::UserJoined(payload.as_str()?.into())),
            EVENT_USER_LEFT => Some(Self::UserLeft(payload.as_str()?.into())),
            other => {
                let kind = SignalKind::from_event_name(other)?;
                let obj = payload.as_object()?;
                Some(Self::Signal(ForwardedSignal {
                    kind,
                    sender: obj.get("sender")?.as_str()?.into(),
                    room_id: obj
                        .get("roomId")
                        .and_then(Value::as_str)
                        .and_then(RoomId::parse),
                    payload: obj.get(kind.payload_field())?.clone(),
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Negotiation payloads (only ever parsed on the client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description in the browser's `{type, sdp}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "type": self.sdp_type, "sdp": self.sdp })
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
