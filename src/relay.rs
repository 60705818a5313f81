use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::protocol::{
    ForwardedSignal, JoinRequest, RoomId, ServerEvent, SessionId, SignalRequest,
};
use crate::registry::{RegistryInfo, RoomRegistry};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Delivery side of the relay: push one event to one session.
///
/// Implementations must not block; delivery to a session that is no longer
/// connected is silently dropped.
pub trait Outbound: Send + Sync + 'static {
    fn deliver(&self, to: &SessionId, event: &ServerEvent);
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Signaling relay: turns inbound client messages into registry updates and
/// forwarded events.
///
/// Every operation runs under the registry lock and emits while holding it,
/// so a joiner's `existing-users` snapshot is always delivered before any
/// `user-joined` caused by a later joiner. Delivery never waits on a client.
pub struct Relay<O: Outbound> {
    registry: Mutex<RoomRegistry>,
    outbound: O,
    enforce_membership: bool,
}

impl<O: Outbound> Relay<O> {
    pub fn new(registry: RoomRegistry, outbound: O) -> Self {
        Self {
            registry: Mutex::new(registry),
            outbound,
            enforce_membership: false,
        }
    }

    /// Only forward negotiation messages when sender and target are both
    /// members of the room named in the message.
    pub fn with_membership_check(mut self, enabled: bool) -> Self {
        self.enforce_membership = enabled;
        self
    }

    fn registry(&self) -> MutexGuard<'_, RoomRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `join-room`: reply with the current members, announce the joiner to them.
    pub fn join(&self, session: &SessionId, request: JoinRequest) {
        let room = request.room_id;
        let mut registry = self.registry();

        // A session is in at most one room.
        for previous in registry.rooms_of(session) {
            if previous != room {
                self.leave_locked(&mut registry, session, &previous);
            }
        }

        let rejoin = registry.is_member(&room, session);
        let existing = registry.join(&room, session);

        self.outbound
            .deliver(session, &ServerEvent::ExistingUsers(existing.clone()));

        if !rejoin {
            let joined = ServerEvent::UserJoined(session.clone());
            for member in &existing {
                self.outbound.deliver(member, &joined);
            }
        }

        info!(
            room = %room,
            user_id = request.user_id.as_deref().unwrap_or("-"),
            participants = existing.len() + 1,
            rejoin,
            "session joined room"
        );
    }

    /// `leave-room`: remove the session and tell the remaining members.
    pub fn leave(&self, session: &SessionId, room: &RoomId) {
        let mut registry = self.registry();
        self.leave_locked(&mut registry, session, room);
    }

    fn leave_locked(&self, registry: &mut RoomRegistry, session: &SessionId, room: &RoomId) {
        let Some(remaining) = registry.leave(room, session) else {
            debug!(room = %room, "leave for a room the session is not in");
            return;
        };
        self.announce_departure(session, room, &remaining);
    }

    fn announce_departure(&self, session: &SessionId, room: &RoomId, remaining: &[SessionId]) {
        let left = ServerEvent::UserLeft(session.clone());
        for member in remaining {
            self.outbound.deliver(member, &left);
        }
        if remaining.is_empty() {
            info!(room = %room, "room is empty, removed");
        } else {
            info!(room = %room, participants = remaining.len(), "session left room");
        }
    }

    /// `offer` / `answer` / `ice-candidate`: unicast to the target, stamped
    /// with the sender. The payload is never looked at.
    pub fn forward(&self, sender: &SessionId, request: SignalRequest) {
        let registry = self.registry();

        if self.enforce_membership {
            let allowed = request.room_id.as_ref().is_some_and(|room| {
                registry.is_member(room, sender) && registry.is_member(room, &request.target)
            });
            if !allowed {
                debug!(kind = request.kind.event_name(), "dropping signal outside a shared room");
                return;
            }
        }

        debug!(
            kind = request.kind.event_name(),
            room = request.room_id.as_ref().map_or("-", RoomId::as_str),
            "relaying signal"
        );

        let event = ServerEvent::Signal(ForwardedSignal {
            kind: request.kind,
            sender: sender.clone(),
            room_id: request.room_id,
            payload: request.payload,
        });
        self.outbound.deliver(&request.target, &event);
    }

    /// Transport disconnect: drop the session from every room it was in and
    /// emit exactly one `user-left` per such room.
    pub fn disconnect(&self, session: &SessionId) {
        let mut registry = self.registry();
        for (room, remaining) in registry.remove_session_everywhere(session) {
            self.announce_departure(session, &room, &remaining);
        }
    }

    pub fn info(&self) -> RegistryInfo {
        self.registry().info()
    }

    pub fn room_members(&self, room: &RoomId) -> Option<Vec<SessionId>> {
        self.registry().members(room)
    }

    pub fn room_exists(&self, room: &RoomId) -> bool {
        self.registry().contains_room(room)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::SignalKind;
    use serde_json::json;
    use std::sync::Arc;

    /// Records every delivery in order.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingOutbound {
        pub sent: Arc<Mutex<Vec<(SessionId, ServerEvent)>>>,
    }

    impl RecordingOutbound {
        pub fn take(&self) -> Vec<(SessionId, ServerEvent)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Outbound for RecordingOutbound {
        fn deliver(&self, to: &SessionId, event: &ServerEvent) {
            self.sent.lock().unwrap().push((to.clone(), event.clone()));
        }
    }

    fn relay() -> (Relay<RecordingOutbound>, RecordingOutbound) {
        let out = RecordingOutbound::default();
        (Relay::new(RoomRegistry::new(), out.clone()), out)
    }

    fn join(room: &str) -> JoinRequest {
        JoinRequest {
            room_id: RoomId::parse(room).unwrap(),
            user_id: None,
        }
    }

    fn sid(id: &str) -> SessionId {
        SessionId::from(id)
    }

    #[test]
    fn two_party_join_sequence() {
        let (relay, out) = relay();

        relay.join(&sid("A"), join("room-1"));
        assert_eq!(out.take(), vec![(sid("A"), ServerEvent::ExistingUsers(vec![]))]);

        relay.join(&sid("B"), join("room-1"));
        assert_eq!(
            out.take(),
            vec![
                (sid("B"), ServerEvent::ExistingUsers(vec![sid("A")])),
                (sid("A"), ServerEvent::UserJoined(sid("B"))),
            ]
        );
    }

    #[test]
    fn rejoin_does_not_rebroadcast() {
        let (relay, out) = relay();
        relay.join(&sid("A"), join("room-1"));
        relay.join(&sid("B"), join("room-1"));
        out.take();

        relay.join(&sid("B"), join("room-1"));
        assert_eq!(
            out.take(),
            vec![(sid("B"), ServerEvent::ExistingUsers(vec![sid("A")]))]
        );
    }

    #[test]
    fn joining_another_room_leaves_the_first() {
        let (relay, out) = relay();
        relay.join(&sid("A"), join("room-1"));
        relay.join(&sid("B"), join("room-1"));
        out.take();

        relay.join(&sid("B"), join("room-2"));
        assert_eq!(
            out.take(),
            vec![
                (sid("A"), ServerEvent::UserLeft(sid("B"))),
                (sid("B"), ServerEvent::ExistingUsers(vec![])),
            ]
        );
        assert_eq!(relay.room_members(&RoomId::parse("room-1").unwrap()), Some(vec![sid("A")]));
    }

    #[test]
    fn offer_is_forwarded_verbatim_with_sender() {
        let (relay, out) = relay();
        relay.join(&sid("A"), join("room-1"));
        relay.join(&sid("B"), join("room-1"));
        out.take();

        let sdp = json!({ "type": "offer", "sdp": "v=0\r\ns=SDP_X\r\n" });
        relay.forward(
            &sid("A"),
            SignalRequest {
                kind: SignalKind::Offer,
                target: sid("B"),
                room_id: RoomId::parse("room-1"),
                payload: sdp.clone(),
            },
        );

        let sent = out.take();
        assert_eq!(sent.len(), 1);
        let (to, event) = &sent[0];
        assert_eq!(to, &sid("B"));
        match event {
            ServerEvent::Signal(signal) => {
                assert_eq!(signal.sender, sid("A"));
                assert_eq!(signal.kind, SignalKind::Offer);
                assert_eq!(signal.room_id.as_ref().unwrap().as_str(), "room-1");
                assert_eq!(
                    serde_json::to_vec(&signal.payload).unwrap(),
                    serde_json::to_vec(&sdp).unwrap()
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn permissive_forwarding_ignores_membership() {
        let (relay, out) = relay();
        relay.forward(
            &sid("stranger"),
            SignalRequest {
                kind: SignalKind::IceCandidate,
                target: sid("B"),
                room_id: None,
                payload: json!({ "candidate": "" }),
            },
        );
        assert_eq!(out.take().len(), 1);
    }

    #[test]
    fn membership_check_drops_outsiders() {
        let out = RecordingOutbound::default();
        let relay = Relay::new(RoomRegistry::new(), out.clone()).with_membership_check(true);
        relay.join(&sid("A"), join("room-1"));
        relay.join(&sid("B"), join("room-1"));
        out.take();

        let answer = || SignalRequest {
            kind: SignalKind::Answer,
            target: sid("B"),
            room_id: RoomId::parse("room-1"),
            payload: json!({ "type": "answer", "sdp": "v=0" }),
        };

        relay.forward(&sid("C"), answer());
        assert!(out.take().is_empty());

        relay.forward(&sid("A"), answer());
        assert_eq!(out.take().len(), 1);

        let mut roomless = answer();
        roomless.room_id = None;
        relay.forward(&sid("A"), roomless);
        assert!(out.take().is_empty());
    }

    #[test]
    fn disconnect_announces_once_per_room() {
        let (relay, out) = relay();
        relay.join(&sid("A"), join("room-1"));
        relay.join(&sid("B"), join("room-1"));
        relay.join(&sid("C"), join("room-1"));
        out.take();

        relay.disconnect(&sid("B"));
        let sent = out.take();
        assert_eq!(
            sent,
            vec![
                (sid("A"), ServerEvent::UserLeft(sid("B"))),
                (sid("C"), ServerEvent::UserLeft(sid("B"))),
            ]
        );
        assert_eq!(
            relay.room_members(&RoomId::parse("room-1").unwrap()),
            Some(vec![sid("A"), sid("C")])
        );

        // A second disconnect for the same session is a no-op.
        relay.disconnect(&sid("B"));
        assert!(out.take().is_empty());
    }

    #[test]
    fn room_disappears_after_last_member_leaves() {
        let (relay, out) = relay();
        let room = RoomId::parse("room-1").unwrap();
        relay.join(&sid("A"), join("room-1"));
        relay.join(&sid("B"), join("room-1"));

        relay.disconnect(&sid("B"));
        assert_eq!(relay.room_members(&room), Some(vec![sid("A")]));

        relay.leave(&sid("A"), &room);
        assert!(!relay.room_exists(&room));
        assert_eq!(relay.info().rooms_active, 0);

        // Leaving again, or leaving a room never joined, sends nothing.
        out.take();
        relay.leave(&sid("A"), &room);
        assert!(out.take().is_empty());
    }

    #[test]
    fn existing_users_always_precede_later_user_joined() {
        let out = RecordingOutbound::default();
        let relay = Arc::new(Relay::new(RoomRegistry::new(), out.clone()));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let relay = relay.clone();
                std::thread::spawn(move || relay.join(&sid(&format!("s{i}")), join("busy")))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // For every session, its existing-users reply comes before any
        // user-joined it receives.
        let sent = out.take();
        for i in 0..16 {
            let me = sid(&format!("s{i}"));
            let mine: Vec<&ServerEvent> = sent
                .iter()
                .filter(|(to, _)| *to == me)
                .map(|(_, ev)| ev)
                .collect();
            assert!(matches!(mine[0], ServerEvent::ExistingUsers(ids) if !ids.contains(&me)));
            assert!(mine[1..].iter().all(|ev| matches!(ev, ServerEvent::UserJoined(_))));
        }
    }
}
