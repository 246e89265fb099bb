//! Blueprint expansion.
//!
//! A blueprint's configuration expands, at canvas-update time, into an
//! internal sub-graph of `parent:child`-namespaced component nodes, each
//! with its own queue and state machine, plus the internal connections
//! between them. Expansion happens here; persistence happens in the canvas
//! service.

use std::collections::HashSet;

use chrono::Utc;
use skein_types::connection::{Connection, ConnectionTarget};
use skein_types::event::EventOrigin;
use skein_types::node::{BlueprintSpec, Node, NodeConfiguration, NodeKind, NodeState};
use uuid::Uuid;

use crate::executor::ValidationError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Configuration problems in a blueprint, rejected at canvas-update time.
#[derive(Debug, thiserror::Error)]
pub enum BlueprintError {
    #[error("blueprint has no internal nodes")]
    Empty,

    #[error("duplicate internal node name '{0}'")]
    DuplicateName(String),

    #[error("edge references unknown internal node '{0}'")]
    UnknownEdgeNode(String),

    #[error("internal node '{name}' has an invalid spec: {source}")]
    InvalidSpec {
        name: String,
        #[source]
        source: ValidationError,
    },
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// Expand a blueprint into its internal nodes and connections.
///
/// Internal nodes are components named `parent:child` with
/// `parent_node_id` pointing at the blueprint. Internal edges become
/// ordinary node-to-node connections, so the router needs no special case
/// for blueprint-internal flow.
pub fn expand(
    parent: &Node,
    spec: &BlueprintSpec,
) -> Result<(Vec<Node>, Vec<Connection>), BlueprintError> {
    if spec.nodes.is_empty() {
        return Err(BlueprintError::Empty);
    }

    let mut seen = HashSet::new();
    for template in &spec.nodes {
        if !seen.insert(template.name.as_str()) {
            return Err(BlueprintError::DuplicateName(template.name.clone()));
        }
        crate::executor::validate_spec(&template.spec).map_err(|source| {
            BlueprintError::InvalidSpec {
                name: template.name.clone(),
                source,
            }
        })?;
    }

    let now = Utc::now();
    let mut nodes = Vec::with_capacity(spec.nodes.len());
    for template in &spec.nodes {
        nodes.push(Node {
            id: Uuid::now_v7(),
            canvas_id: parent.canvas_id,
            name: Node::namespaced(&parent.name, &template.name),
            kind: NodeKind::Component,
            state: NodeState::Ready,
            state_reason: None,
            parent_node_id: Some(parent.id),
            configuration: NodeConfiguration::Component {
                spec: template.spec.clone(),
            },
            deleted_at: None,
            created_at: now,
            updated_at: now,
        });
    }

    let id_of = |short: &str| -> Option<Uuid> {
        spec.nodes
            .iter()
            .position(|t| t.name == short)
            .map(|i| nodes[i].id)
    };

    let mut connections = Vec::with_capacity(spec.edges.len());
    for edge in &spec.edges {
        let source_id = id_of(&edge.source)
            .ok_or_else(|| BlueprintError::UnknownEdgeNode(edge.source.clone()))?;
        let target_id = id_of(&edge.target)
            .ok_or_else(|| BlueprintError::UnknownEdgeNode(edge.target.clone()))?;
        connections.push(Connection::direct(
            parent.canvas_id,
            EventOrigin::Node,
            source_id,
            ConnectionTarget::Node { id: target_id },
        ));
    }

    Ok((nodes, connections))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use skein_types::node::{BlueprintEdge, BlueprintNode};
    use skein_types::spec::ExecutorSpec;

    fn parent() -> Node {
        Node {
            id: Uuid::now_v7(),
            canvas_id: Uuid::now_v7(),
            name: "release".to_string(),
            kind: NodeKind::Blueprint,
            state: NodeState::Ready,
            state_reason: None,
            parent_node_id: None,
            configuration: NodeConfiguration::Blueprint {
                blueprint: BlueprintSpec {
                    nodes: vec![],
                    edges: vec![],
                },
            },
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn template(name: &str) -> BlueprintNode {
        BlueprintNode {
            name: name.to_string(),
            spec: ExecutorSpec::NoOp {},
        }
    }

    #[test]
    fn expansion_namespaces_nodes_and_wires_edges() {
        let parent = parent();
        let spec = BlueprintSpec {
            nodes: vec![template("build"), template("publish")],
            edges: vec![BlueprintEdge {
                source: "build".to_string(),
                target: "publish".to_string(),
            }],
        };

        let (nodes, connections) = expand(&parent, &spec).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "release:build");
        assert_eq!(nodes[1].name, "release:publish");
        assert!(nodes.iter().all(|n| n.parent_node_id == Some(parent.id)));
        assert!(nodes.iter().all(|n| n.kind == NodeKind::Component));

        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].source_id, nodes[0].id);
        assert_eq!(
            connections[0].target,
            ConnectionTarget::Node { id: nodes[1].id }
        );
    }

    #[test]
    fn empty_blueprint_is_a_configuration_error() {
        let spec = BlueprintSpec {
            nodes: vec![],
            edges: vec![],
        };
        assert!(matches!(expand(&parent(), &spec), Err(BlueprintError::Empty)));
    }

    #[test]
    fn duplicate_internal_names_rejected() {
        let spec = BlueprintSpec {
            nodes: vec![template("build"), template("build")],
            edges: vec![],
        };
        assert!(matches!(
            expand(&parent(), &spec),
            Err(BlueprintError::DuplicateName(name)) if name == "build"
        ));
    }

    #[test]
    fn edge_to_unknown_node_rejected() {
        let spec = BlueprintSpec {
            nodes: vec![template("build")],
            edges: vec![BlueprintEdge {
                source: "build".to_string(),
                target: "missing".to_string(),
            }],
        };
        assert!(matches!(
            expand(&parent(), &spec),
            Err(BlueprintError::UnknownEdgeNode(name)) if name == "missing"
        ));
    }

    #[test]
    fn invalid_internal_spec_rejected() {
        let spec = BlueprintSpec {
            nodes: vec![BlueprintNode {
                name: "ci".to_string(),
                spec: ExecutorSpec::CiTask {
                    branch: String::new(),
                    task: "unit".to_string(),
                    parameters: Default::default(),
                },
            }],
            edges: vec![],
        };
        assert!(matches!(
            expand(&parent(), &spec),
            Err(BlueprintError::InvalidSpec { name, .. }) if name == "ci"
        ));
    }
}
