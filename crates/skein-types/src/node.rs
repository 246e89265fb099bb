//! Node types for the canvas graph.
//!
//! A node is a graph vertex: a component (executes a spec), a trigger
//! (originates events), a blueprint (expands into an internal sub-graph), or
//! a widget (annotation only). Nodes own a processing state that is derived
//! from execution activity but mutated independently by pause/resume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::spec::ExecutorSpec;

/// Separator between a blueprint node's name and its internal node names.
pub const BLUEPRINT_SEPARATOR: char = ':';

// ---------------------------------------------------------------------------
// Kind and state
// ---------------------------------------------------------------------------

/// The kind of canvas node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Component,
    Trigger,
    Blueprint,
    Widget,
}

/// Processing state of a node, orthogonal to its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Eligible to dequeue its next queue item.
    Ready,
    /// Currently has a started execution.
    Processing,
    /// Held by an operator; items accumulate but are never dequeued.
    Paused,
    /// Misconfigured; diagnosable independently of any run history.
    Error,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Node-kind-specific configuration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfiguration {
    /// A component runs an executor spec against its backend.
    Component { spec: ExecutorSpec },
    /// A trigger originates events on a named channel.
    Trigger { channel: String },
    /// A blueprint expands into an internal sub-graph at canvas-update time.
    Blueprint { blueprint: BlueprintSpec },
    /// A widget is annotation only; it never queues or executes.
    Widget {
        #[serde(default)]
        content: Value,
    },
}

impl NodeConfiguration {
    /// The node kind this configuration belongs to.
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfiguration::Component { .. } => NodeKind::Component,
            NodeConfiguration::Trigger { .. } => NodeKind::Trigger,
            NodeConfiguration::Blueprint { .. } => NodeKind::Blueprint,
            NodeConfiguration::Widget { .. } => NodeKind::Widget,
        }
    }
}

/// The internal sub-graph a blueprint expands into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintSpec {
    /// Internal node templates; names are unique within the blueprint.
    pub nodes: Vec<BlueprintNode>,
    /// Internal edges between template names.
    #[serde(default)]
    pub edges: Vec<BlueprintEdge>,
}

/// One internal node template inside a blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintNode {
    /// Short name; the expanded node is named `parent:name`.
    pub name: String,
    pub spec: ExecutorSpec,
}

/// A directed edge between two internal blueprint nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintEdge {
    pub source: String,
    pub target: String,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A canvas graph vertex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// UUIDv7 node ID.
    pub id: Uuid,
    /// Owning canvas (tenant scope).
    pub canvas_id: Uuid,
    /// Unique name within the canvas; internal nodes are `parent:child`.
    pub name: String,
    pub kind: NodeKind,
    pub state: NodeState,
    /// Human-readable reason for the current state (set for Error, cleared
    /// on recovery).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<String>,
    /// Set only for blueprint-internal nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<Uuid>,
    pub configuration: NodeConfiguration,
    /// Tombstone; nodes are never hard-deleted while history references them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Only component and blueprint nodes support pause/resume.
    pub fn supports_pause(&self) -> bool {
        matches!(self.kind, NodeKind::Component | NodeKind::Blueprint)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Namespaced name for a blueprint-internal node.
    pub fn namespaced(parent: &str, child: &str) -> String {
        format!("{parent}{BLUEPRINT_SEPARATOR}{child}")
    }

    /// Split a namespaced internal name into (parent, child), if namespaced.
    pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
        name.split_once(BLUEPRINT_SEPARATOR)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
