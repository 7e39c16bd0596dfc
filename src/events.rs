//! Event Bus (§4.H): in-process topic emitter with a last-event cache per
//! topic and at-most-once "replay on subscribe" (no persistence, per
//! spec.md's Non-goals).
//!
//! Grounded on the `broadcast::Sender`/per-client `mpsc::UnboundedSender`
//! split in the teacher's `SubscriptionManager`
//! (`integration/mcp/subscriptions.rs`): one shared broadcast channel feeds
//! every WebSocket Hub fan-out task, while the last-event cache behind a
//! `RwLock<HashMap<...>>` lets a newly-opened subscription replay the most
//! recent matching event without waiting for the next emission.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// The closed set of event topics spec.md §3 names. Both producers and
/// WebSocket subscriptions are keyed by this type (GLOSSARY "Topic").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FileChange,
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    RelationshipCreated,
    RelationshipDeleted,
    GraphUpdate,
    SyncStatus,
    SessionEvent,
}

impl EventType {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::FileChange => "file_change",
            Self::EntityCreated => "entity_created",
            Self::EntityUpdated => "entity_updated",
            Self::EntityDeleted => "entity_deleted",
            Self::RelationshipCreated => "relationship_created",
            Self::RelationshipDeleted => "relationship_deleted",
            Self::GraphUpdate => "graph_update",
            Self::SyncStatus => "sync_status",
            Self::SessionEvent => "session_event",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "file_change" => Some(Self::FileChange),
            "entity_created" => Some(Self::EntityCreated),
            "entity_updated" => Some(Self::EntityUpdated),
            "entity_deleted" => Some(Self::EntityDeleted),
            "relationship_created" => Some(Self::RelationshipCreated),
            "relationship_deleted" => Some(Self::RelationshipDeleted),
            "graph_update" => Some(Self::GraphUpdate),
            "sync_status" => Some(Self::SyncStatus),
            "session_event" => Some(Self::SessionEvent),
            _ => None,
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self, Self::EntityCreated | Self::EntityUpdated | Self::EntityDeleted)
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self, Self::RelationshipCreated | Self::RelationshipDeleted)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire_str())
    }
}

/// `{ type, timestamp, data, source? }` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Capacity of the shared broadcast channel. Generous enough that a normal
/// burst of producer activity never forces a slow fan-out task to miss
/// events before it has drained the channel; a lagging receiver still logs
/// a warning rather than silently losing events unnoticed.
const CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<Event>,
    last_event: RwLock<HashMap<EventType, Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            last_event: RwLock::new(HashMap::new()),
        }
    }

    /// Store `event` as the last event for its topic and notify every
    /// subscriber of the shared broadcast channel. Delivery to a single
    /// subscriber is in-order per topic because there is exactly one
    /// channel and one producer call site at a time (§5 ordering
    /// guarantee); interleaving across topics is unspecified.
    pub fn emit(&self, event: Event) {
        self.last_event
            .write()
            .unwrap()
            .insert(event.event_type, event.clone());
        // No live subscriber is not an error: the event is still cached for
        // replay-on-subscribe.
        let _ = self.sender.send(event);
    }

    pub fn last_event(&self, event_type: EventType) -> Option<Event> {
        self.last_event.read().unwrap().get(&event_type).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
