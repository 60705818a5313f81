use std::sync::Arc;

use serde_json::Value;
use socketioxide::extract::{Data, SocketRef};
use socketioxide::SocketIo;
use tracing::{debug, info};

use crate::protocol::{
    parse_leave, JoinRequest, ServerEvent, SessionId, SignalKind, SignalRequest, EVENT_JOIN_ROOM,
    EVENT_LEAVE_ROOM,
};
use crate::relay::Outbound;
use crate::AppState;

// ---------------------------------------------------------------------------
// Outbound over Socket.IO
// ---------------------------------------------------------------------------

/// Delivers relay events through the Socket.IO server. Every connection sits
/// in a private room named after its session id, so unicast is a room emit.
#[derive(Clone)]
pub struct SocketIoOutbound {
    io: SocketIo,
}

impl SocketIoOutbound {
    pub fn new(io: SocketIo) -> Self {
        Self { io }
    }
}

impl Outbound for SocketIoOutbound {
    fn deliver(&self, to: &SessionId, event: &ServerEvent) {
        // Top-level arrays are spread into separate event arguments; wrap them
        // so clients receive the list as one argument.
        let payload = match event.payload() {
            Value::Array(items) => Value::Array(vec![Value::Array(items)]),
            other => other,
        };
        if let Err(e) = self
            .io
            .to(to.to_string())
            .emit(event.event_name(), &payload)
        {
            debug!(error = %e, event = event.event_name(), "delivery dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

/// Name used for a connection in logs (masked when IP masking is on).
#[derive(Debug, Clone)]
struct LogIdentity(String);

fn session_id(socket: &SocketRef) -> SessionId {
    SessionId::new(socket.id.to_string())
}

fn log_identity(socket: &SocketRef) -> String {
    socket
        .extensions
        .get::<LogIdentity>()
        .map(|l| l.0.clone())
        .unwrap_or_else(|| socket.id.to_string())
}

pub fn on_connect(socket: SocketRef, state: Arc<AppState>) {
    let session = session_id(&socket);
    let identity = if state.config.ip_masking {
        session.masked()
    } else {
        session.to_string()
    };
    socket.extensions.insert(LogIdentity(identity.clone()));

    // Sync handlers run inline in the receive loop: events from one
    // connection, disconnect included, reach the relay in arrival order.
    socket.on(EVENT_JOIN_ROOM, {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| on_join_room(&socket, &payload, &state)
    });

    socket.on(EVENT_LEAVE_ROOM, {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| on_leave_room(&socket, &payload, &state)
    });

    for kind in SignalKind::ALL {
        socket.on(kind.event_name(), {
            let state = state.clone();
            move |socket: SocketRef, Data::<Value>(payload)| {
                on_signal(&socket, kind, &payload, &state)
            }
        });
    }

    socket.on_disconnect({
        let state = state.clone();
        move |socket: SocketRef| on_disconnect(&socket, &state)
    });

    // Private addressing room for unicast delivery.
    socket.join(session.to_string()).ok();

    info!(client = %identity, "client connected");
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

fn on_join_room(socket: &SocketRef, payload: &Value, state: &AppState) {
    let Some(request) = JoinRequest::from_value(payload) else {
        debug!(client = %log_identity(socket), "malformed join-room dropped");
        return;
    };
    info!(client = %log_identity(socket), room = %request.room_id, "joining room");
    state.relay.join(&session_id(socket), request);
}

fn on_leave_room(socket: &SocketRef, payload: &Value, state: &AppState) {
    let Some(room) = parse_leave(payload) else {
        debug!(client = %log_identity(socket), "malformed leave-room dropped");
        return;
    };
    info!(client = %log_identity(socket), room = %room, "leaving room");
    state.relay.leave(&session_id(socket), &room);
}

fn on_signal(socket: &SocketRef, kind: SignalKind, payload: &Value, state: &AppState) {
    let Some(request) = SignalRequest::from_value(kind, payload) else {
        debug!(
            client = %log_identity(socket),
            kind = kind.event_name(),
            "malformed signal dropped"
        );
        return;
    };
    debug!(client = %log_identity(socket), kind = kind.event_name(), "relaying");
    state.relay.forward(&session_id(socket), request);
}

fn on_disconnect(socket: &SocketRef, state: &AppState) {
    info!(client = %log_identity(socket), "client disconnected");
    state.relay.disconnect(&session_id(socket));
}
