use std::io;
use std::time::Duration;

use crate::protocol::RoomId;

// ─── Capture errors ─────────────────────────────────────────────────────────

/// Local camera/microphone acquisition failure. Never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture permission denied")]
    PermissionDenied,

    #[error("capture device not found")]
    NotFound,

    #[error("capture device already in use")]
    InUse,

    #[error("capture constraints cannot be satisfied: {0}")]
    ConstraintsUnsatisfiable(String),

    #[error("capture device error: {0}")]
    Device(#[source] io::Error),
}

impl CaptureError {
    /// Actionable text for the person at the keyboard.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "Camera or microphone permission denied",
            Self::NotFound => "No camera or microphone found",
            Self::InUse => "Camera or microphone is already in use",
            Self::ConstraintsUnsatisfiable(_) => "Camera constraints not satisfied",
            Self::Device(_) => "Could not access camera or microphone",
        }
    }
}

impl From<io::Error> for CaptureError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::ResourceBusy => Self::InUse,
            io::ErrorKind::InvalidInput => Self::ConstraintsUnsatisfiable(err.to_string()),
            _ => Self::Device(err),
        }
    }
}

// ─── Negotiation errors ─────────────────────────────────────────────────────

/// Per-peer handshake failure. Moves that peer to `failed`, leaves the others
/// untouched.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("peer connection error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("connectivity checks failed")]
    ConnectivityFailed,

    #[error("peer did not connect within {0:?}")]
    TimedOut(Duration),
}

impl NegotiationError {
    /// Negotiation failures are shown without protocol detail.
    pub fn user_message(&self) -> &'static str {
        "Connection failed"
    }
}

// ─── Transport errors ───────────────────────────────────────────────────────

/// Relay connection failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to the signaling server")]
    NotConnected,

    #[error("signaling connection closed")]
    Closed,

    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl TransportError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "Signaling server address is invalid",
            _ => "Failed to connect to signaling server",
        }
    }
}

// ─── Session errors ─────────────────────────────────────────────────────────

/// Errors surfaced by call-level operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("already in call '{0}'")]
    AlreadyInCall(RoomId),
}

impl SessionError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Capture(e) => e.user_message(),
            Self::Transport(e) => e.user_message(),
            Self::AlreadyInCall(_) => "Leave the current call first",
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
