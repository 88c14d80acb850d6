//! Realtime gateway.
//!
//! A [`Gateway`] holds the live client sessions of one process and bridges
//! them to the event bus:
//!
//! ```text
//!            bus topic "task-events:{room}"
//!   ┌──────────────┐            ┌──────────────┐
//!   │  Gateway A   │◀── bus ───▶│  Gateway B   │
//!   └──┬───────┬───┘            └──┬───────┬───┘
//!      │       │                   │       │
//!   client  client              client  client
//! ```
//!
//! - Bus events are forwarded verbatim to local members of the event's room
//!   and never published back.
//! - Client moves go to the sender's local room peers right away and are
//!   published with this instance's id as `origin`. When the bus hands that
//!   message back, this instance skips it; its peers already have it.
//! - A move from a session in several rooms is published once per room and
//!   lists all of them. A receiving instance hands it to a session only
//!   through the first listed room that session is in.
//!
//! The gateway subscribes to exactly the topics whose rooms have at least
//! one local member. Sessions are owned by this process only; a client
//! that reconnects starts from nothing and refetches.

pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod ws;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{publish_with_retry, BusHandler, EventBus, PublishOutcome, TopicSet};
use crate::event::{BusMessage, MutationEvent, TASK_EVENT_NAMES};

pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use protocol::{validate_room, ClientMessage, MoveRequest};
pub use registry::{ConnectionState, Frame, SessionId, SessionRegistry};

/// Room every session joins on connect unless configured otherwise.
pub const DEFAULT_ROOM: &str = "all";

/// Prefix of the bus topics carrying task events.
pub const DEFAULT_TOPIC_PREFIX: &str = "task-events";

/// Frames buffered per session before new ones are dropped.
pub const DEFAULT_SEND_BUFFER: usize = 256;

/// Bus topic for a room.
pub fn topic_for_room(prefix: &str, room: &str) -> String {
    format!("{}:{}", prefix, room)
}

/// Room addressed by a bus topic, if the topic belongs to `prefix`.
pub fn room_for_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(prefix)?
        .strip_prefix(':')
        .filter(|room| !room.is_empty())
}

/// Gateway errors. All of them concern a single client frame or session;
/// none closes the connection.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("malformed client event: {0}")]
    Malformed(String),

    #[error("unsupported client event: {0}")]
    UnsupportedEvent(String),

    #[error("invalid room name: {0:?}")]
    InvalidRoom(String),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A newly registered session and the frames addressed to it.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub frames: mpsc::Receiver<Frame>,
}

/// Result of relaying a client move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    /// Local sessions the move was handed to
    pub local_deliveries: usize,
    /// Publish outcome per room topic
    pub published: Vec<(String, PublishOutcome)>,
}

/// What a client frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutcome {
    Joined(String),
    Left(String),
    Relayed(RelayReport),
}

/// One gateway process.
pub struct Gateway {
    instance_id: String,
    topic_prefix: String,
    default_room: Option<String>,
    send_buffer: usize,
    bus: Arc<dyn EventBus>,
    registry: RwLock<SessionRegistry>,
    topics: watch::Sender<TopicSet>,
    metrics: GatewayMetrics,
}

impl Gateway {
    pub fn new(instance_id: impl Into<String>, bus: Arc<dyn EventBus>) -> Self {
        let (topics, _) = watch::channel(TopicSet::new());
        Self {
            instance_id: instance_id.into(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            default_room: Some(DEFAULT_ROOM.to_string()),
            send_buffer: DEFAULT_SEND_BUFFER,
            bus,
            registry: RwLock::new(SessionRegistry::new()),
            topics,
            metrics: GatewayMetrics::new(),
        }
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Room joined on connect; `None` leaves new sessions in no room.
    pub fn with_default_room(mut self, room: Option<String>) -> Self {
        self.default_room = room;
        self
    }

    pub fn with_send_buffer(mut self, frames: usize) -> Self {
        self.send_buffer = frames.max(1);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Topics currently subscribed on the bus.
    pub fn topics(&self) -> TopicSet {
        self.topics.borrow().clone()
    }

    pub async fn session_count(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn rooms_of(&self, id: SessionId) -> Result<BTreeSet<String>, GatewayError> {
        self.registry.read().await.rooms_of(id)
    }

    /// Connection state of a session. Sessions no longer in the registry
    /// report `Closed`.
    pub async fn state_of(&self, id: SessionId) -> ConnectionState {
        self.registry
            .read()
            .await
            .state(id)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Start the bus subscription. It follows the set of occupied rooms for
    /// as long as the bus stays open.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        info!(
            instance_id = %self.instance_id,
            bus = %self.bus.name(),
            topic_prefix = %self.topic_prefix,
            "Gateway subscribing to bus"
        );
        let handler: Arc<dyn BusHandler> = self.clone();
        self.bus.subscribe(self.topics.subscribe(), handler)
    }

    /// Register a new session, joining the default room if one is set.
    pub async fn connect(&self) -> SessionHandle {
        let id = SessionId::new();
        let (tx, frames) = mpsc::channel(self.send_buffer);

        let mut registry = self.registry.write().await;
        registry.insert(id, tx);
        if let Some(room) = &self.default_room {
            // The id was inserted just above, join cannot miss it
            let _ = registry.join(id, room);
        }
        self.sync_topics(&registry);
        drop(registry);

        self.metrics.connection_opened();
        info!(session_id = %id, default_room = ?self.default_room, "Session connected");

        SessionHandle { id, frames }
    }

    pub async fn join(&self, id: SessionId, room: &str) -> Result<(), GatewayError> {
        validate_room(room)?;
        let mut registry = self.registry.write().await;
        if registry.join(id, room)? {
            self.sync_topics(&registry);
            debug!(session_id = %id, room = %room, "Joined room");
        }
        Ok(())
    }

    pub async fn leave(&self, id: SessionId, room: &str) -> Result<(), GatewayError> {
        let mut registry = self.registry.write().await;
        if registry.leave(id, room)? {
            self.sync_topics(&registry);
            debug!(session_id = %id, room = %room, "Left room");
        }
        Ok(())
    }

    /// Drop all state for a session. Frames still queued for it are
    /// discarded with its channel. Returns false if the session was already
    /// gone.
    pub async fn disconnect(&self, id: SessionId) -> bool {
        let mut registry = self.registry.write().await;
        let Some(rooms) = registry.remove(id) else {
            return false;
        };
        self.sync_topics(&registry);
        drop(registry);

        self.metrics.connection_closed();
        info!(session_id = %id, rooms = rooms.len(), "Session disconnected");
        true
    }

    /// Forward one bus message to the local members of its room.
    ///
    /// Returns the number of sessions the frame was handed to.
    pub async fn on_bus_event(&self, topic: &str, payload: &str) -> usize {
        self.metrics.bus_event();

        let Some(room) = room_for_topic(&self.topic_prefix, topic) else {
            warn!(topic = %topic, "Bus message on foreign topic ignored");
            return 0;
        };

        let message: BusMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Unreadable bus message dropped");
                return 0;
            }
        };

        if message.origin.as_deref() == Some(self.instance_id.as_str()) {
            self.metrics.echo_skipped();
            debug!(topic = %topic, event_name = %message.envelope.event_name, "Own relay skipped");
            return 0;
        }

        if !TASK_EVENT_NAMES.contains(&message.envelope.event_name.as_str()) {
            warn!(
                topic = %topic,
                event_name = %message.envelope.event_name,
                "Unknown event name on bus, not forwarded"
            );
            return 0;
        }

        let frame: Frame = match serde_json::to_string(&message.envelope) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!(topic = %topic, error = %e, "Envelope not serializable");
                return 0;
            }
        };

        // A multi-room relay arrives once per target room. Members of an
        // earlier-sorting target room are served by that room's copy.
        let shadowing = message.rooms_before(room);
        let delivered = self.broadcast(&[room], &frame, None, &shadowing).await;
        debug!(
            topic = %topic,
            event_name = %message.envelope.event_name,
            delivered = delivered,
            "Bus event forwarded"
        );
        delivered
    }

    /// Handle a raw frame from a client.
    pub async fn on_client_event(
        &self,
        id: SessionId,
        text: &str,
    ) -> Result<ClientOutcome, GatewayError> {
        self.metrics.client_event();
        let message = ClientMessage::parse(text).inspect_err(|_| self.metrics.malformed_event())?;
        self.handle_client_message(id, message).await
    }

    pub async fn handle_client_message(
        &self,
        id: SessionId,
        message: ClientMessage,
    ) -> Result<ClientOutcome, GatewayError> {
        match message {
            ClientMessage::Join(room) => {
                self.join(id, &room).await?;
                Ok(ClientOutcome::Joined(room))
            }
            ClientMessage::Leave(room) => {
                self.leave(id, &room).await?;
                Ok(ClientOutcome::Left(room))
            }
            ClientMessage::Move(request) => {
                let report = self.relay_move(id, &request).await?;
                Ok(ClientOutcome::Relayed(report))
            }
        }
    }

    /// Hand a client move to its room peers here and to every sibling
    /// instance through the bus.
    async fn relay_move(
        &self,
        id: SessionId,
        request: &MoveRequest,
    ) -> Result<RelayReport, GatewayError> {
        let rooms = self.registry.read().await.rooms_of(id)?;

        let envelope = MutationEvent::Moved(request.to_move()).to_envelope()?;
        let frame: Frame = Arc::from(serde_json::to_string(&envelope)?);
        let mut message = BusMessage::new(envelope).with_origin(self.instance_id.as_str());
        if rooms.len() > 1 {
            message = message.with_rooms(rooms.iter().cloned());
        }
        let payload = serde_json::to_string(&message)?;

        let room_refs: Vec<&str> = rooms.iter().map(String::as_str).collect();
        let local_deliveries = self.broadcast(&room_refs, &frame, Some(id), &[]).await;

        let mut published = Vec::with_capacity(rooms.len());
        for room in &rooms {
            let topic = topic_for_room(&self.topic_prefix, room);
            let outcome = publish_with_retry(self.bus.as_ref(), &topic, &payload).await;
            published.push((topic, outcome));
        }

        info!(
            session_id = %id,
            task_id = %request.id,
            column_id = %request.column_id,
            rooms = rooms.len(),
            local_deliveries = local_deliveries,
            "Client move relayed"
        );

        Ok(RelayReport {
            local_deliveries,
            published,
        })
    }

    async fn broadcast(
        &self,
        rooms: &[&str],
        frame: &Frame,
        exclude: Option<SessionId>,
        shadowing: &[&str],
    ) -> usize {
        let delivery = self.registry.read().await.deliver_unless_in(
            rooms.iter().copied(),
            frame,
            exclude,
            shadowing,
        );

        self.metrics.delivered(delivery.delivered, delivery.failed);

        if !delivery.closed.is_empty() {
            let mut registry = self.registry.write().await;
            for id in &delivery.closed {
                registry.mark(*id, ConnectionState::Disconnecting);
            }
        }
        delivery.delivered
    }

    /// Point the bus subscription at the rooms that still have members.
    fn sync_topics(&self, registry: &SessionRegistry) {
        let wanted: TopicSet = registry
            .occupied_rooms()
            .iter()
            .map(|room| topic_for_room(&self.topic_prefix, room))
            .collect();

        let changed = self.topics.send_if_modified(|current| {
            if *current == wanted {
                false
            } else {
                *current = wanted.clone();
                true
            }
        });

        if changed {
            info!(instance_id = %self.instance_id, topics = ?wanted, "Bus topics updated");
        }
    }
}

#[async_trait]
impl BusHandler for Gateway {
    async fn on_message(&self, topic: &str, payload: &str) {
        self.on_bus_event(topic, payload).await;
    }
}
