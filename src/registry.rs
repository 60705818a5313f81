use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::protocol::{RoomId, SessionId};

// ---------------------------------------------------------------------------
// RoomRegistry
// ---------------------------------------------------------------------------

/// In-memory mapping from room id to the sessions currently in it.
///
/// A room exists exactly as long as it has at least one member: it is created
/// by the first `join` and deleted by the `leave` (or disconnect) that empties
/// it. Nothing is persisted; a restarted relay simply starts empty.
///
/// The registry is a plain owned value. Callers that share it across tasks
/// wrap it in their own lock, which also gives them the sequencing guarantee
/// they need around the messages they emit.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, HashSet<SessionId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session` to `room` (creating the room if needed) and return the
    /// members that were already there, never including `session` itself.
    ///
    /// Joining a room twice is a no-op apart from the returned snapshot.
    pub fn join(&mut self, room: &RoomId, session: &SessionId) -> Vec<SessionId> {
        let members = self.rooms.entry(room.clone()).or_default();
        members.insert(session.clone());

        let mut existing: Vec<SessionId> = members
            .iter()
            .filter(|id| *id != session)
            .cloned()
            .collect();
        existing.sort();
        existing
    }

    /// Remove `session` from `room`, deleting the room if it became empty.
    ///
    /// Returns the remaining members when the session was actually removed,
    /// `None` when either the room or the membership did not exist.
    pub fn leave(&mut self, room: &RoomId, session: &SessionId) -> Option<Vec<SessionId>> {
        let members = self.rooms.get_mut(room)?;
        if !members.remove(session) {
            return None;
        }

        let mut remaining: Vec<SessionId> = members.iter().cloned().collect();
        remaining.sort();
        if remaining.is_empty() {
            self.rooms.remove(room);
        }
        Some(remaining)
    }

    /// Drop `session` from every room that contains it.
    ///
    /// Returns one `(room, remaining members)` pair per room it was removed
    /// from. Rooms that became empty are deleted and reported with an empty
    /// member list.
    pub fn remove_session_everywhere(&mut self, session: &SessionId) -> Vec<(RoomId, Vec<SessionId>)> {
        let mut affected: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.contains(session))
            .map(|(room, _)| room.clone())
            .collect();
        affected.sort();

        affected
            .into_iter()
            .filter_map(|room| {
                let remaining = self.leave(&room, session)?;
                Some((room, remaining))
            })
            .collect()
    }

    /// Rooms that currently list `session` as a member.
    pub fn rooms_of(&self, session: &SessionId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.contains(session))
            .map(|(room, _)| room.clone())
            .collect();
        rooms.sort();
        rooms
    }

    pub fn is_member(&self, room: &RoomId, session: &SessionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(session))
    }

    pub fn contains_room(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    /// Sorted member snapshot, `None` if the room does not exist.
    pub fn members(&self, room: &RoomId) -> Option<Vec<SessionId>> {
        self.rooms.get(room).map(|members| {
            let mut ids: Vec<SessionId> = members.iter().cloned().collect();
            ids.sort();
            ids
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn session_count(&self) -> usize {
        self.rooms.values().map(HashSet::len).sum()
    }

    /// Serialisable summary for the health endpoint.
    pub fn info(&self) -> RegistryInfo {
        RegistryInfo {
            rooms_active: self.room_count(),
            sessions_active: self.session_count(),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistryInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryInfo {
    pub rooms_active: usize,
    pub sessions_active: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
