//! Execution lifecycle operations: cancel, resolve, pause, resume.
//!
//! Cancellation is always parent-initiated: cancelling a parent cascades
//! depth-first through every descendant inside one atomic store operation
//! before finalizing the parent; cancelling a child directly is rejected.
//! It is authoritative for local bookkeeping (result = CANCELLED
//! immediately, nodes freed) and cooperative for remote backends -- a late
//! remote completion is dropped by the finish guard.

use std::sync::Arc;

use skein_types::error::RepositoryError;
use skein_types::execution::Execution;
use skein_types::node::{NodeKind, NodeState};
use uuid::Uuid;

use crate::repository::{ExecutionRepository, NodeRepository, Store};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Invariant violations and lifecycle failures, rejected at the boundary
/// with a named condition rather than silently coerced.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot cancel child execution directly")]
    CannotCancelChild,

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("{0} nodes do not support pause")]
    PauseUnsupported(&'static str),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

fn kind_name(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Component => "component",
        NodeKind::Trigger => "trigger",
        NodeKind::Blueprint => "blueprint",
        NodeKind::Widget => "widget",
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle operations exposed to the API boundary.
pub struct Lifecycle<S> {
    store: Arc<S>,
}

impl<S: Store> Lifecycle<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Cancel an execution and every transitive descendant.
    ///
    /// Rejects non-root targets: a blueprint-internal child can only be
    /// cancelled through its parent. Returns the executions finalized by
    /// the cascade (the root plus K descendants).
    pub async fn cancel(
        &self,
        execution_id: &Uuid,
        cancelled_by: &str,
    ) -> Result<Vec<Execution>, StateError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(StateError::ExecutionNotFound(*execution_id))?;
        if execution.is_child() {
            return Err(StateError::CannotCancelChild);
        }

        let finalized = self.store.cancel_cascade(execution_id, cancelled_by).await?;

        // Free every node the cascade touched so queued work can resume.
        for cancelled in &finalized {
            self.store.release_node(&cancelled.node_id).await?;
        }

        tracing::info!(
            execution_id = %execution_id,
            cancelled_by,
            cascade = finalized.len(),
            "execution cancelled"
        );
        Ok(finalized)
    }

    /// Mark a failed execution's error as resolved by an operator.
    ///
    /// Changes only the result reason; the result stays FAILED and nothing
    /// is re-triggered.
    pub async fn resolve_error(&self, execution_id: &Uuid) -> Result<(), StateError> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or(StateError::ExecutionNotFound(*execution_id))?;
        let resolved = self.store.resolve_error(execution_id).await?;
        if !resolved {
            return Err(StateError::FailedPrecondition(
                "execution is not in a failed error state".to_string(),
            ));
        }
        tracing::info!(execution_id = %execution_id, "execution error resolved");
        Ok(())
    }

    /// Pause a node. Idempotent for already-paused nodes; rejected for
    /// trigger/widget nodes and for nodes in ERROR.
    pub async fn pause(&self, node_id: &Uuid) -> Result<(), StateError> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(StateError::NodeNotFound(*node_id))?;
        if !node.supports_pause() {
            return Err(StateError::PauseUnsupported(kind_name(node.kind)));
        }
        if node.state == NodeState::Error {
            return Err(StateError::FailedPrecondition(
                "cannot pause a node in error state".to_string(),
            ));
        }
        let paused = self.store.pause_node(node_id).await?;
        if !paused {
            // Raced into a non-pausable state between the read and the write.
            return Err(StateError::FailedPrecondition(
                "node can no longer be paused".to_string(),
            ));
        }
        tracing::info!(node = node.name.as_str(), "node paused");
        Ok(())
    }

    /// Resume a paused node, recomputing its correct next state atomically:
    /// PROCESSING if an execution is currently STARTED, READY otherwise.
    /// Resuming a node that is not paused is a no-op.
    pub async fn resume(&self, node_id: &Uuid) -> Result<NodeState, StateError> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(StateError::NodeNotFound(*node_id))?;
        if !node.supports_pause() {
            return Err(StateError::PauseUnsupported(kind_name(node.kind)));
        }
        if node.state == NodeState::Error {
            return Err(StateError::FailedPrecondition(
                "cannot resume a node in error state".to_string(),
            ));
        }
        match self.store.resume_node(node_id).await? {
            Some(state) => {
                tracing::info!(node = node.name.as_str(), state = ?state, "node resumed");
                Ok(state)
            }
            None => Ok(node.state),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::EventRepository;
    use crate::testing::InMemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use skein_types::event::{Event, EventOrigin};
    use skein_types::execution::{ExecutionResult, ExecutionState, ResultReason};
    use skein_types::node::{Node, NodeConfiguration};
    use skein_types::spec::ExecutorSpec;

    struct Fixture {
        store: Arc<InMemoryStore>,
        lifecycle: Lifecycle<InMemoryStore>,
        canvas_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::default());
        Fixture {
            lifecycle: Lifecycle::new(Arc::clone(&store)),
            store,
            canvas_id: Uuid::now_v7(),
        }
    }

    fn node(canvas_id: Uuid, name: &str, kind: NodeKind, state: NodeState) -> Node {
        let configuration = match kind {
            NodeKind::Component => NodeConfiguration::Component {
                spec: ExecutorSpec::NoOp {},
            },
            NodeKind::Trigger => NodeConfiguration::Trigger {
                channel: "push".to_string(),
            },
            NodeKind::Blueprint => NodeConfiguration::Blueprint {
                blueprint: skein_types::node::BlueprintSpec {
                    nodes: vec![],
                    edges: vec![],
                },
            },
            NodeKind::Widget => NodeConfiguration::Widget {
                content: json!({}),
            },
        };
        Node {
            id: Uuid::now_v7(),
            canvas_id,
            name: name.to_string(),
            kind,
            state,
            state_reason: None,
            parent_node_id: None,
            configuration,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn started_execution(
        fx: &Fixture,
        node_id: Uuid,
        parent: Option<Uuid>,
    ) -> Execution {
        let event = Event::chain_root(
            fx.canvas_id,
            EventOrigin::EventSource,
            Uuid::now_v7(),
            "push",
            "git.push",
            json!({}),
        );
        fx.store.create_event(&event).await.unwrap();
        let execution = Execution::pending(
            node_id,
            NodeConfiguration::Component {
                spec: ExecutorSpec::NoOp {},
            },
            event.root_id,
            event.id,
            parent,
            None,
        );
        assert!(fx.store.try_create_execution(&execution).await.unwrap());
        assert!(
            fx.store
                .mark_started(&execution.id, Utc::now())
                .await
                .unwrap()
        );
        fx.store.get_execution(&execution.id).await.unwrap().unwrap()
    }

    // -------------------------------------------------------------------
    // Cancellation cascade
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn cancel_parent_cascades_to_all_descendants() {
        let fx = fixture();
        let blueprint = node(fx.canvas_id, "release", NodeKind::Blueprint, NodeState::Processing);
        fx.store.upsert_node(&blueprint).await.unwrap();
        let parent = started_execution(&fx, blueprint.id, None).await;

        // Two children and one grandchild.
        let mut child_nodes = Vec::new();
        for name in ["release:a", "release:b"] {
            let mut n = node(fx.canvas_id, name, NodeKind::Component, NodeState::Processing);
            n.parent_node_id = Some(blueprint.id);
            fx.store.upsert_node(&n).await.unwrap();
            child_nodes.push(n);
        }
        let child_a = started_execution(&fx, child_nodes[0].id, Some(parent.id)).await;
        let _child_b = started_execution(&fx, child_nodes[1].id, Some(parent.id)).await;
        let mut nested = node(
            fx.canvas_id,
            "release:a:inner",
            NodeKind::Component,
            NodeState::Processing,
        );
        nested.parent_node_id = Some(child_nodes[0].id);
        fx.store.upsert_node(&nested).await.unwrap();
        let _grandchild = started_execution(&fx, nested.id, Some(child_a.id)).await;

        let finalized = fx.lifecycle.cancel(&parent.id, "operator").await.unwrap();

        // K descendants + the parent, all FINISHED/CANCELLED.
        assert_eq!(finalized.len(), 4);
        for execution in fx.store.all_executions_for_test() {
            assert_eq!(execution.state, ExecutionState::Finished);
            assert_eq!(execution.result, Some(ExecutionResult::Cancelled));
            assert_eq!(execution.cancelled_by.as_deref(), Some("operator"));
        }
        // Every touched node is freed.
        for n in [&blueprint, &child_nodes[0], &child_nodes[1], &nested] {
            let stored = fx.store.get_node(&n.id).await.unwrap().unwrap();
            assert_eq!(stored.state, NodeState::Ready);
        }
    }

    #[tokio::test]
    async fn cancel_child_directly_is_rejected_and_changes_nothing() {
        let fx = fixture();
        let blueprint = node(fx.canvas_id, "release", NodeKind::Blueprint, NodeState::Processing);
        fx.store.upsert_node(&blueprint).await.unwrap();
        let parent = started_execution(&fx, blueprint.id, None).await;

        let mut internal = node(
            fx.canvas_id,
            "release:a",
            NodeKind::Component,
            NodeState::Processing,
        );
        internal.parent_node_id = Some(blueprint.id);
        fx.store.upsert_node(&internal).await.unwrap();
        let child = started_execution(&fx, internal.id, Some(parent.id)).await;

        let err = fx.lifecycle.cancel(&child.id, "operator").await.unwrap_err();
        assert!(matches!(err, StateError::CannotCancelChild));
        assert_eq!(err.to_string(), "cannot cancel child execution directly");

        // Nothing moved.
        let child = fx.store.get_execution(&child.id).await.unwrap().unwrap();
        assert_eq!(child.state, ExecutionState::Started);
        let parent = fx.store.get_execution(&parent.id).await.unwrap().unwrap();
        assert_eq!(parent.state, ExecutionState::Started);
    }

    #[tokio::test]
    async fn cancel_skips_already_finished_descendants() {
        let fx = fixture();
        let blueprint = node(fx.canvas_id, "release", NodeKind::Blueprint, NodeState::Processing);
        fx.store.upsert_node(&blueprint).await.unwrap();
        let parent = started_execution(&fx, blueprint.id, None).await;

        let mut internal = node(
            fx.canvas_id,
            "release:a",
            NodeKind::Component,
            NodeState::Ready,
        );
        internal.parent_node_id = Some(blueprint.id);
        fx.store.upsert_node(&internal).await.unwrap();
        let child = started_execution(&fx, internal.id, Some(parent.id)).await;
        fx.store
            .finish_execution(
                &child.id,
                ExecutionResult::Passed,
                ResultReason::Ok,
                None,
                &serde_json::Map::new(),
            )
            .await
            .unwrap();

        let finalized = fx.lifecycle.cancel(&parent.id, "operator").await.unwrap();
        assert_eq!(finalized.len(), 1); // only the parent

        let child = fx.store.get_execution(&child.id).await.unwrap().unwrap();
        assert_eq!(child.result, Some(ExecutionResult::Passed));
    }

    // -------------------------------------------------------------------
    // Error resolution
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn resolve_error_changes_reason_only() {
        let fx = fixture();
        let component = node(fx.canvas_id, "deploy", NodeKind::Component, NodeState::Ready);
        fx.store.upsert_node(&component).await.unwrap();
        let execution = started_execution(&fx, component.id, None).await;
        fx.store
            .finish_execution(
                &execution.id,
                ExecutionResult::Failed,
                ResultReason::Error,
                Some("boom"),
                &serde_json::Map::new(),
            )
            .await
            .unwrap();

        fx.lifecycle.resolve_error(&execution.id).await.unwrap();

        let stored = fx.store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.result, Some(ExecutionResult::Failed));
        assert_eq!(stored.result_reason, Some(ResultReason::ErrorResolved));
        assert_eq!(stored.result_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn resolve_error_rejects_passed_execution() {
        let fx = fixture();
        let component = node(fx.canvas_id, "deploy", NodeKind::Component, NodeState::Ready);
        fx.store.upsert_node(&component).await.unwrap();
        let execution = started_execution(&fx, component.id, None).await;
        fx.store
            .finish_execution(
                &execution.id,
                ExecutionResult::Passed,
                ResultReason::Ok,
                None,
                &serde_json::Map::new(),
            )
            .await
            .unwrap();

        let err = fx.lifecycle.resolve_error(&execution.id).await.unwrap_err();
        assert!(matches!(err, StateError::FailedPrecondition(_)));
    }

    // -------------------------------------------------------------------
    // Pause / resume
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn pause_is_idempotent_from_ready_and_paused() {
        let fx = fixture();
        let component = node(fx.canvas_id, "deploy", NodeKind::Component, NodeState::Ready);
        fx.store.upsert_node(&component).await.unwrap();

        fx.lifecycle.pause(&component.id).await.unwrap();
        fx.lifecycle.pause(&component.id).await.unwrap();

        let stored = fx.store.get_node(&component.id).await.unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Paused);
    }

    #[tokio::test]
    async fn pause_rejected_for_trigger_and_widget() {
        let fx = fixture();
        let trigger = node(fx.canvas_id, "on-push", NodeKind::Trigger, NodeState::Ready);
        let widget = node(fx.canvas_id, "note", NodeKind::Widget, NodeState::Ready);
        fx.store.upsert_node(&trigger).await.unwrap();
        fx.store.upsert_node(&widget).await.unwrap();

        let err = fx.lifecycle.pause(&trigger.id).await.unwrap_err();
        assert_eq!(err.to_string(), "trigger nodes do not support pause");
        let err = fx.lifecycle.pause(&widget.id).await.unwrap_err();
        assert!(matches!(err, StateError::PauseUnsupported("widget")));
    }

    #[tokio::test]
    async fn pause_rejected_for_error_node() {
        let fx = fixture();
        let mut component = node(fx.canvas_id, "deploy", NodeKind::Component, NodeState::Error);
        component.state_reason = Some("missing secret".to_string());
        fx.store.upsert_node(&component).await.unwrap();

        let err = fx.lifecycle.pause(&component.id).await.unwrap_err();
        assert!(matches!(err, StateError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn resume_with_started_execution_goes_processing() {
        let fx = fixture();
        let component = node(fx.canvas_id, "deploy", NodeKind::Component, NodeState::Processing);
        fx.store.upsert_node(&component).await.unwrap();
        started_execution(&fx, component.id, None).await;

        // Pause while the execution is STARTED, then resume.
        fx.lifecycle.pause(&component.id).await.unwrap();
        let state = fx.lifecycle.resume(&component.id).await.unwrap();
        assert_eq!(state, NodeState::Processing);
    }

    #[tokio::test]
    async fn resume_without_active_execution_goes_ready() {
        let fx = fixture();
        let component = node(fx.canvas_id, "deploy", NodeKind::Component, NodeState::Paused);
        fx.store.upsert_node(&component).await.unwrap();

        let state = fx.lifecycle.resume(&component.id).await.unwrap();
        assert_eq!(state, NodeState::Ready);
    }

    #[tokio::test]
    async fn resume_of_unpaused_node_is_a_noop() {
        let fx = fixture();
        let component = node(fx.canvas_id, "deploy", NodeKind::Component, NodeState::Ready);
        fx.store.upsert_node(&component).await.unwrap();

        let state = fx.lifecycle.resume(&component.id).await.unwrap();
        assert_eq!(state, NodeState::Ready);
    }
}
