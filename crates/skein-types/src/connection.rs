//! Connections: typed edges feeding events into nodes or connection groups.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventOrigin;

/// What a connection delivers into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionTarget {
    Node { id: Uuid },
    Group { id: Uuid },
}

impl ConnectionTarget {
    pub fn id(&self) -> Uuid {
        match self {
            ConnectionTarget::Node { id } | ConnectionTarget::Group { id } => *id,
        }
    }
}

/// How multiple filters on one connection combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[default]
    And,
    Or,
}

/// A single filter expression, evaluated against `{event, channel, type}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionFilter {
    pub expression: String,
}

/// A typed edge from an event producer to a node or connection group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// UUIDv7 connection ID.
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub source_type: EventOrigin,
    pub source_id: Uuid,
    pub target: ConnectionTarget,
    /// No filters means every event from the source matches.
    #[serde(default)]
    pub filters: Vec<ConnectionFilter>,
    #[serde(default)]
    pub filter_operator: FilterOperator,
}

impl Connection {
    /// Build an unfiltered edge.
    pub fn direct(
        canvas_id: Uuid,
        source_type: EventOrigin,
        source_id: Uuid,
        target: ConnectionTarget,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            canvas_id,
            source_type,
            source_id,
            target,
            filters: Vec::new(),
            filter_operator: FilterOperator::And,
        }
    }
}
