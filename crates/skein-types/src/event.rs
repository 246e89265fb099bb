//! Events and queue items.
//!
//! An `Event` is an immutable record of data on a named output channel,
//! produced by a trigger source, a node, or a connection group. A
//! `QueueItem` is a pointer to an event awaiting execution by a specific
//! node; it is created when a connection matches and destroyed on dequeue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default output channel for component emissions.
pub const DEFAULT_CHANNEL: &str = "default";

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// An external event source (trigger/webhook).
    EventSource,
    /// A node emission (component output, blueprint completion).
    Node,
    /// A connection-group completion or partial-timeout emission.
    ConnectionGroup,
}

/// An immutable event record. Created once, read many times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// UUIDv7 event ID.
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub origin: EventOrigin,
    /// The trigger source, node, or connection group that produced it.
    pub source_id: Uuid,
    /// Named output channel.
    pub channel: String,
    pub event_type: String,
    pub payload: Value,
    /// Optional resolved custom display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Top of the causal chain. External events and group emissions start a
    /// chain (root = own id); node output events inherit their execution's.
    pub root_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Build a chain-starting event (external source or group emission).
    pub fn chain_root(
        canvas_id: Uuid,
        origin: EventOrigin,
        source_id: Uuid,
        channel: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            canvas_id,
            origin,
            source_id,
            channel: channel.into(),
            event_type: event_type.into(),
            payload,
            display_name: None,
            root_id: id,
            created_at: Utc::now(),
        }
    }
}

/// A pending (node, event) pair awaiting execution.
///
/// Ordered by creation time; the UUIDv7 id breaks ties monotonically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub node_id: Uuid,
    pub event_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(node_id: Uuid, event_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            node_id,
            event_id,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_root_event_points_at_itself() {
        let event = Event::chain_root(
            Uuid::now_v7(),
            EventOrigin::EventSource,
            Uuid::now_v7(),
            "push",
            "git.push",
            json!({"ref": "refs/heads/main"}),
        );
        assert_eq!(event.root_id, event.id);
        assert_eq!(event.channel, "push");
    }

    #[test]
    fn event_origin_serde_names() {
        assert_eq!(
            serde_json::to_string(&EventOrigin::EventSource).unwrap(),
            "\"event_source\""
        );
        assert_eq!(
            serde_json::to_string(&EventOrigin::ConnectionGroup).unwrap(),
            "\"connection_group\""
        );
    }

    #[test]
    fn queue_item_ids_are_monotonic() {
        let node_id = Uuid::now_v7();
        let a = QueueItem::new(node_id, Uuid::now_v7());
        let b = QueueItem::new(node_id, Uuid::now_v7());
        assert!(a.id < b.id, "v7 ids must sort by creation order");
    }
}
