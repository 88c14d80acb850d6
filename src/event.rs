//! Event types exchanged between the writer, the bus, gateways and clients.
//!
//! The [`MutationEvent`] enum is produced once per committed write and
//! serializes directly into the client wire envelope:
//!
//! ```json
//! {
//!   "event_name": "moved",
//!   "payload": { "id": "t1", "column_id": "in_progress" }
//! }
//! ```
//!
//! On the bus the same envelope is wrapped in a [`BusMessage`] that may carry
//! the id of the gateway instance that originated it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::{Column, Task, TaskId};

pub const CREATED: &str = "created";
pub const UPDATED: &str = "updated";
pub const DELETED: &str = "deleted";
pub const MOVED: &str = "moved";

/// Event names forwarded to clients.
pub const TASK_EVENT_NAMES: [&str; 4] = [CREATED, UPDATED, DELETED, MOVED];

/// Payload of a `deleted` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deletion {
    pub id: TaskId,

    /// Commit time of the delete, when the writer knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Payload of a `moved` event.
///
/// Moves relayed straight from a client carry no timestamp; they are
/// provisional until the authoritative `updated` event arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Move {
    pub id: TaskId,

    #[serde(alias = "column")]
    pub column_id: Column,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A committed change to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_name", content = "payload", rename_all = "lowercase")]
pub enum MutationEvent {
    Created(Task),
    Updated(Task),
    Deleted(Deletion),
    Moved(Move),
}

impl MutationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MutationEvent::Created(_) => CREATED,
            MutationEvent::Updated(_) => UPDATED,
            MutationEvent::Deleted(_) => DELETED,
            MutationEvent::Moved(_) => MOVED,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            MutationEvent::Created(task) | MutationEvent::Updated(task) => &task.id,
            MutationEvent::Deleted(deletion) => &deletion.id,
            MutationEvent::Moved(mv) => &mv.id,
        }
    }

    /// The logical version carried by the event, if any.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            MutationEvent::Created(task) | MutationEvent::Updated(task) => Some(task.updated_at),
            MutationEvent::Deleted(deletion) => deletion.updated_at,
            MutationEvent::Moved(mv) => mv.updated_at,
        }
    }

    /// Full task representation, for events that carry one.
    pub fn task(&self) -> Option<&Task> {
        match self {
            MutationEvent::Created(task) | MutationEvent::Updated(task) => Some(task),
            _ => None,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(envelope)?)
    }
}

/// Message envelope delivered to and received from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_name: String,

    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
        }
    }
}

/// Payload published on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Gateway instance that originated the event (absent for writer events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Every room the same message was published to, sorted. Empty for
    /// single-room messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rooms: Vec<String>,

    #[serde(flatten)]
    pub envelope: Envelope,
}

impl BusMessage {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            origin: None,
            rooms: Vec::new(),
            envelope,
        }
    }

    pub fn with_rooms<I, S>(mut self, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rooms = rooms.into_iter().map(Into::into).collect();
        self.rooms.sort();
        self.rooms.dedup();
        self
    }

    /// Target rooms sorting before `room`. A session that is a member of
    /// one of them already got the message on that room's topic.
    pub fn rooms_before(&self, room: &str) -> Vec<&str> {
        self.rooms
            .iter()
            .map(String::as_str)
            .filter(|other| *other < room)
            .collect()
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn from_event(event: &MutationEvent) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event.to_envelope()?))
    }
}
