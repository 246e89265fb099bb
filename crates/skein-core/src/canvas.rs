//! Canvas maintenance: node/group/connection upserts with validation.
//!
//! Validation happens before persistence: component specs go through the
//! executor's static check, blueprints are expanded (and their internal
//! specs checked) up front, and a connection group must arrive with at
//! least one incoming connection and one group-by field. Removed nodes and
//! groups are tombstoned, never hard-deleted, because execution history
//! references them.

use std::sync::Arc;

use chrono::Utc;
use skein_types::connection::{Connection, ConnectionTarget};
use skein_types::error::RepositoryError;
use skein_types::group::ConnectionGroup;
use skein_types::node::{Node, NodeConfiguration, NodeKind, NodeState};
use uuid::Uuid;

use crate::blueprint::{self, BlueprintError};
use crate::executor::{Executor, ValidationError};
use crate::repository::{
    ConnectionRepository, GroupRepository, NodeRepository, Store,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Canvas-update failures, rejected synchronously before persistence.
#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("invalid spec: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid blueprint: {0}")]
    Blueprint(#[from] BlueprintError),

    #[error("connection group requires at least one connection")]
    GroupWithoutConnections,

    #[error("connection group requires at least one group-by field")]
    GroupWithoutFields,

    #[error("connections cannot target {0} nodes")]
    InvalidTarget(&'static str),

    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("node name '{0}' is already in use")]
    NameTaken(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// CanvasService
// ---------------------------------------------------------------------------

/// Applies canvas updates against the store.
pub struct CanvasService<S, X> {
    store: Arc<S>,
    executor: Arc<X>,
}

impl<S: Store, X: Executor> CanvasService<S, X> {
    pub fn new(store: Arc<S>, executor: Arc<X>) -> Self {
        Self { store, executor }
    }

    /// Create a node. Component specs are validated; blueprints are expanded
    /// into their internal sub-graph in the same call.
    pub async fn add_node(
        &self,
        canvas_id: Uuid,
        name: &str,
        configuration: NodeConfiguration,
    ) -> Result<Node, CanvasError> {
        if self
            .store
            .get_node_by_name(&canvas_id, name)
            .await?
            .is_some()
        {
            return Err(CanvasError::NameTaken(name.to_string()));
        }

        if let NodeConfiguration::Component { spec } = &configuration {
            self.executor.validate(spec)?;
        }

        let now = Utc::now();
        let node = Node {
            id: Uuid::now_v7(),
            canvas_id,
            name: name.to_string(),
            kind: configuration.kind(),
            state: NodeState::Ready,
            state_reason: None,
            parent_node_id: None,
            configuration,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };

        // Expand before persisting anything so a bad blueprint rejects whole.
        let expansion = match &node.configuration {
            NodeConfiguration::Blueprint { blueprint: spec } => {
                Some(blueprint::expand(&node, spec)?)
            }
            _ => None,
        };

        self.store.upsert_node(&node).await?;
        if let Some((internal_nodes, internal_connections)) = expansion {
            for internal in &internal_nodes {
                self.store.upsert_node(internal).await?;
            }
            for connection in &internal_connections {
                self.store.upsert_connection(connection).await?;
            }
            tracing::info!(
                node = node.name.as_str(),
                internal = internal_nodes.len(),
                "blueprint expanded"
            );
        }

        tracing::info!(node = node.name.as_str(), kind = ?node.kind, "node added");
        Ok(node)
    }

    /// Tombstone a node, its blueprint-internal nodes, and drop the edges
    /// touching them. Execution history stays behind.
    pub async fn remove_node(&self, node_id: &Uuid) -> Result<(), CanvasError> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(CanvasError::NodeNotFound(*node_id))?;

        let mut doomed = vec![node.clone()];
        doomed.extend(self.store.list_internal_nodes(node_id).await?);

        for n in &doomed {
            self.store.soft_delete_node(&n.id).await?;
            for connection in self
                .store
                .connections_from(skein_types::event::EventOrigin::Node, &n.id)
                .await?
            {
                self.store.delete_connection(&connection.id).await?;
            }
            for connection in self.store.connections_into_node(&n.id).await? {
                self.store.delete_connection(&connection.id).await?;
            }
        }

        tracing::info!(node = node.name.as_str(), "node removed");
        Ok(())
    }

    /// Create a connection group with its incoming connections.
    ///
    /// A group with zero connections or zero group-by fields is a
    /// creation-time configuration error.
    pub async fn add_group(
        &self,
        group: ConnectionGroup,
        incoming: Vec<Connection>,
    ) -> Result<ConnectionGroup, CanvasError> {
        if incoming.is_empty() {
            return Err(CanvasError::GroupWithoutConnections);
        }
        if group.group_by.is_empty() {
            return Err(CanvasError::GroupWithoutFields);
        }

        self.store.upsert_group(&group).await?;
        for connection in &incoming {
            let mut connection = connection.clone();
            connection.target = ConnectionTarget::Group { id: group.id };
            self.store.upsert_connection(&connection).await?;
        }

        tracing::info!(
            group = group.name.as_str(),
            connections = incoming.len(),
            "connection group added"
        );
        Ok(group)
    }

    /// Tombstone a group. Its field-set history stays behind; arrivals on a
    /// deleted group are rejected by the aggregation engine.
    pub async fn remove_group(&self, group_id: &Uuid) -> Result<bool, CanvasError> {
        let removed = self.store.soft_delete_group(group_id).await?;
        for connection in self.store.connections_into_group(group_id).await? {
            self.store.delete_connection(&connection.id).await?;
        }
        Ok(removed)
    }

    /// Add an edge. Trigger and widget nodes cannot be targets: a trigger
    /// originates events and a widget is annotation only.
    pub async fn connect(&self, connection: Connection) -> Result<Connection, CanvasError> {
        if let ConnectionTarget::Node { id } = connection.target {
            let target = self
                .store
                .get_node(&id)
                .await?
                .ok_or(CanvasError::NodeNotFound(id))?;
            match target.kind {
                NodeKind::Trigger => return Err(CanvasError::InvalidTarget("trigger")),
                NodeKind::Widget => return Err(CanvasError::InvalidTarget("widget")),
                NodeKind::Component | NodeKind::Blueprint => {}
            }
        }
        self.store.upsert_connection(&connection).await?;
        Ok(connection)
    }

    /// Flag a node as misconfigured, independently of any run history.
    pub async fn flag_error(&self, node_id: &Uuid, reason: &str) -> Result<(), CanvasError> {
        self.store
            .get_node(node_id)
            .await?
            .ok_or(CanvasError::NodeNotFound(*node_id))?;
        self.store
            .set_node_state(node_id, NodeState::Error, Some(reason))
            .await?;
        tracing::warn!(node_id = %node_id, reason, "node flagged as misconfigured");
        Ok(())
    }

    /// Clear a node's error flag after reconfiguration.
    pub async fn clear_error(&self, node_id: &Uuid) -> Result<(), CanvasError> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(CanvasError::NodeNotFound(*node_id))?;
        if node.state == NodeState::Error {
            self.store
                .set_node_state(node_id, NodeState::Ready, None)
                .await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
