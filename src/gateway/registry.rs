//! Per-process session and room bookkeeping.
//!
//! The registry maps each session id to its outbound frame channel and room
//! set, and keeps the inverse room -> members index used for broadcasts.
//! It is owned by one [`Gateway`](super::Gateway) and never shared across
//! processes.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::GatewayError;

/// A serialized envelope, shared between every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connectivity of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    /// The outbound channel closed; waiting for the socket task to clean up
    Disconnecting,
    Closed,
}

#[derive(Debug)]
struct Session {
    frames: mpsc::Sender<Frame>,
    rooms: BTreeSet<String>,
    state: ConnectionState,
}

/// Result of pushing one frame to a set of sessions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
    /// Sessions whose channel turned out to be closed
    pub closed: Vec<SessionId>,
}

/// Session table plus room index.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    rooms: HashMap<String, HashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SessionId, frames: mpsc::Sender<Frame>) {
        self.sessions.insert(
            id,
            Session {
                frames,
                rooms: BTreeSet::new(),
                state: ConnectionState::Connected,
            },
        );
    }

    /// Drop a session and its memberships. Returns the rooms it was in.
    pub fn remove(&mut self, id: SessionId) -> Option<BTreeSet<String>> {
        let session = self.sessions.remove(&id)?;
        for room in &session.rooms {
            self.remove_member(room, id);
        }
        Some(session.rooms)
    }

    /// Add a session to a room. Returns true if the session was not
    /// already a member.
    pub fn join(&mut self, id: SessionId, room: &str) -> Result<bool, GatewayError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(GatewayError::UnknownSession(id))?;

        if !session.rooms.insert(room.to_string()) {
            return Ok(false);
        }
        self.rooms.entry(room.to_string()).or_default().insert(id);
        Ok(true)
    }

    /// Remove a session from a room. Returns true if it was a member.
    pub fn leave(&mut self, id: SessionId, room: &str) -> Result<bool, GatewayError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(GatewayError::UnknownSession(id))?;

        if !session.rooms.remove(room) {
            return Ok(false);
        }
        self.remove_member(room, id);
        Ok(true)
    }

    fn remove_member(&mut self, room: &str, id: SessionId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    pub fn rooms_of(&self, id: SessionId) -> Result<BTreeSet<String>, GatewayError> {
        self.sessions
            .get(&id)
            .map(|session| session.rooms.clone())
            .ok_or(GatewayError::UnknownSession(id))
    }

    /// Rooms with at least one local member.
    pub fn occupied_rooms(&self) -> BTreeSet<String> {
        self.rooms.keys().cloned().collect()
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    pub fn state(&self, id: SessionId) -> Option<ConnectionState> {
        self.sessions.get(&id).map(|session| session.state)
    }

    pub fn mark(&mut self, id: SessionId, state: ConnectionState) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.state = state;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Push `frame` to every member of `rooms`, each session at most once,
    /// skipping `exclude`.
    ///
    /// A full or closed channel only affects its own session.
    pub fn deliver<'a>(
        &self,
        rooms: impl IntoIterator<Item = &'a str>,
        frame: &Frame,
        exclude: Option<SessionId>,
    ) -> Delivery {
        self.deliver_unless_in(rooms, frame, exclude, &[])
    }

    /// Like [`deliver`](Self::deliver), but also skips members of any room
    /// in `shadowing`.
    pub fn deliver_unless_in<'a>(
        &self,
        rooms: impl IntoIterator<Item = &'a str>,
        frame: &Frame,
        exclude: Option<SessionId>,
        shadowing: &[&str],
    ) -> Delivery {
        let mut recipients: BTreeSet<SessionId> = BTreeSet::new();
        for room in rooms {
            if let Some(members) = self.rooms.get(room) {
                recipients.extend(members.iter().copied());
            }
        }
        if let Some(excluded) = exclude {
            recipients.remove(&excluded);
        }
        for room in shadowing {
            if let Some(members) = self.rooms.get(*room) {
                recipients.retain(|id| !members.contains(id));
            }
        }

        let mut delivery = Delivery::default();
        for id in recipients {
            let Some(session) = self.sessions.get(&id) else {
                continue;
            };
            if session.state != ConnectionState::Connected {
                continue;
            }

            match session.frames.try_send(frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(session_id = %id, "Session send buffer full, frame dropped");
                    delivery.failed += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(session_id = %id, "Session channel closed");
                    delivery.failed += 1;
                    delivery.closed.push(id);
                }
            }
        }
        delivery
    }
}
