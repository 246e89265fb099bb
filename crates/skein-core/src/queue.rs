//! Per-node queue discipline and executor dispatch.
//!
//! One FIFO per node, ordered by arrival. A node dequeues its oldest item
//! only when it is READY and the guarded insert of a new PENDING execution
//! succeeds -- the partial-unique single-active invariant in the store is
//! the back-pressure mechanism, not an in-process lock, so any worker
//! instance may dispatch.
//!
//! Completion is fed by three producers -- the synchronous execute path,
//! the reconciler's `check`, and webhooks -- all funneled through one
//! first-completion-wins transition keyed on execution id.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use skein_types::error::RepositoryError;
use skein_types::event::{DEFAULT_CHANNEL, Event, EventOrigin, QueueItem};
use skein_types::execution::{Execution, ExecutionResult, ExecutionState, ResultReason};
use skein_types::node::{Node, NodeConfiguration, NodeKind, NodeState};
use skein_types::spec::ExecutorSpec;
use uuid::Uuid;

use crate::executor::{
    BindingProvider, ExecutionParameters, Executor, ExecutorError, ExecutorResponse, TokenSigner,
};
use crate::expression::resolve_spec;
use crate::repository::{
    ConnectionRepository, EventRepository, ExecutionRepository, NodeRepository, Store,
};
use crate::router::{EventRouter, RouterError};

/// Event type carried by successful component emissions.
pub const EVENT_TYPE_PASSED: &str = "execution.passed";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during dispatch.
///
/// Resolution and backend failures are not surfaced here -- they finalize
/// the execution as FAILED/ERROR with the message preserved.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("router error: {0}")]
    Router(#[from] RouterError),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Dequeues ready work and drives executions to completion.
///
/// Generic over the store, the executor set, the binding provider, and the
/// token signer -- all built once at startup and shared by every worker.
pub struct Dispatcher<S, X, B, T> {
    store: Arc<S>,
    executor: Arc<X>,
    bindings: Arc<B>,
    signer: Arc<T>,
    router: Arc<EventRouter<S>>,
}

impl<S, X, B, T> Dispatcher<S, X, B, T>
where
    S: Store,
    X: Executor,
    B: BindingProvider,
    T: TokenSigner,
{
    pub fn new(store: Arc<S>, executor: Arc<X>, bindings: Arc<B>, signer: Arc<T>) -> Self {
        Self {
            router: Arc::new(EventRouter::new(Arc::clone(&store))),
            store,
            executor,
            bindings,
            signer,
        }
    }

    pub fn router(&self) -> &Arc<EventRouter<S>> {
        &self.router
    }

    /// One pass over every node with backlog. Returns started execution ids.
    pub async fn tick_all(&self) -> Result<Vec<Uuid>, DispatchError> {
        let mut started = Vec::new();
        for node_id in self.store.nodes_with_backlog().await? {
            if let Some(execution_id) = self.tick_node(&node_id).await? {
                started.push(execution_id);
            }
        }
        Ok(started)
    }

    /// One dequeue-and-dispatch attempt for a node.
    ///
    /// Returns the started execution id, or `None` when the node is not
    /// eligible (paused, erroring, busy, empty queue).
    pub async fn tick_node(&self, node_id: &Uuid) -> Result<Option<Uuid>, DispatchError> {
        let Some(node) = self.store.get_node(node_id).await? else {
            return Ok(None);
        };
        if node.is_deleted() || node.state != NodeState::Ready {
            return Ok(None);
        }
        let Some(item) = self.store.queue_head(node_id).await? else {
            return Ok(None);
        };
        let Some(input) = self.store.get_event(&item.event_id).await? else {
            // Dangling pointer; drop the item rather than wedge the queue.
            tracing::warn!(node = node.name.as_str(), item_id = %item.id, "queue item references missing event");
            self.store.delete_queue_item(&item.id).await?;
            return Ok(None);
        };
        if matches!(node.kind, NodeKind::Trigger | NodeKind::Widget) {
            tracing::warn!(node = node.name.as_str(), "non-executing node had queued work; dropping");
            self.store.delete_queue_item(&item.id).await?;
            return Ok(None);
        }

        // Blueprint-internal nodes inherit the causal chain and parent
        // linkage from the blueprint execution that fanned them out.
        let (root_event_id, parent_execution_id) = match node.parent_node_id {
            Some(parent_node_id) => {
                match self.store.active_execution(&parent_node_id).await? {
                    Some(parent) if parent.state == ExecutionState::Started => {
                        (parent.root_event_id, Some(parent.id))
                    }
                    _ => {
                        // The parent run is gone (cancelled or finished);
                        // its fanned-out work is obsolete.
                        self.store.delete_queue_item(&item.id).await?;
                        return Ok(None);
                    }
                }
            }
            None => (input.root_id, None),
        };

        let previous = self.store.latest_execution_id(node_id).await?;
        let execution = Execution::pending(
            node.id,
            node.configuration.clone(),
            root_event_id,
            input.id,
            parent_execution_id,
            previous,
        );
        if !self.store.try_create_execution(&execution).await? {
            // Single-active invariant: another execution is still in flight.
            return Ok(None);
        }
        self.store.delete_queue_item(&item.id).await?;
        self.store.mark_started(&execution.id, Utc::now()).await?;
        self.store.occupy_node(&node.id).await?;

        tracing::info!(
            node = node.name.as_str(),
            execution_id = %execution.id,
            input_event_id = %input.id,
            "execution started"
        );

        self.dispatch(&node, &execution, &input).await?;
        Ok(Some(execution.id))
    }

    /// Build the concrete backend call and perform it.
    async fn dispatch(
        &self,
        node: &Node,
        execution: &Execution,
        input: &Event,
    ) -> Result<(), DispatchError> {
        let spec = match &execution.configuration {
            NodeConfiguration::Blueprint { .. } => {
                return self.fan_out_blueprint(node, input).await;
            }
            NodeConfiguration::Component { spec } => spec.clone(),
            _ => {
                return self
                    .fail(execution, "node configuration cannot execute".to_string())
                    .await;
            }
        };

        let bindings = match self.bindings.bindings_for(execution).await {
            Ok(bindings) => bindings,
            Err(e) => return self.fail(execution, e.to_string()).await,
        };

        // Resolution fails closed: nothing is sent to the backend.
        let raw = match serde_json::to_value(&spec) {
            Ok(raw) => raw,
            Err(e) => return self.fail(execution, e.to_string()).await,
        };
        let resolved_value = match resolve_spec(&raw, &bindings) {
            Ok(resolved) => resolved,
            Err(e) => return self.fail(execution, e.to_string()).await,
        };
        let resolved: ExecutorSpec = match serde_json::from_value(resolved_value) {
            Ok(resolved) => resolved,
            Err(e) => {
                return self
                    .fail(execution, format!("resolved spec is invalid: {e}"))
                    .await;
            }
        };

        let params = ExecutionParameters {
            execution_id: execution.id,
            node_id: node.id,
            token: self.signer.token_for(&execution.id),
        };

        match self.executor.execute(&resolved, &params).await {
            Ok(response) if response.finished => {
                let (result, reason) = outcome(&response);
                self.finalize(execution, result, reason, None, response.outputs)
                    .await?;
                Ok(())
            }
            Ok(response) => match response.backend_id {
                Some(backend_id) => {
                    self.store
                        .record_backend_id(&execution.id, &backend_id)
                        .await?;
                    tracing::debug!(
                        execution_id = %execution.id,
                        backend_id = backend_id.as_str(),
                        "execution awaiting async completion"
                    );
                    Ok(())
                }
                None => {
                    self.fail(execution, "backend returned no correlation id".to_string())
                        .await
                }
            },
            Err(e) => self.fail(execution, e.to_string()).await,
        }
    }

    /// Route the blueprint's input event into its internal entry nodes.
    /// The parent execution stays STARTED until the internal run drains.
    async fn fan_out_blueprint(&self, node: &Node, input: &Event) -> Result<(), DispatchError> {
        let internal = self.store.list_internal_nodes(&node.id).await?;
        let mut entries = Vec::new();
        for candidate in &internal {
            let incoming = self.store.connections_into_node(&candidate.id).await?;
            let fed_internally = incoming
                .iter()
                .any(|c| internal.iter().any(|n| n.id == c.source_id));
            if !fed_internally {
                entries.push(candidate);
            }
        }

        if entries.is_empty() {
            // Degenerate blueprint: nothing to run, complete immediately.
            let Some(execution) = self.store.active_execution(&node.id).await? else {
                return Ok(());
            };
            self.finalize(
                &execution,
                ExecutionResult::Passed,
                ResultReason::Ok,
                None,
                Map::new(),
            )
            .await?;
            return Ok(());
        }

        for entry in entries {
            self.store
                .enqueue(&QueueItem::new(entry.id, input.id))
                .await?;
        }
        tracing::info!(
            blueprint = node.name.as_str(),
            internal_nodes = internal.len(),
            "blueprint fanned out"
        );
        Ok(())
    }

    /// Idempotent completion fed by the reconciler and webhook paths.
    ///
    /// Returns `true` if this call finalized the execution. Completions for
    /// executions that are no longer STARTED (already finished, cancelled)
    /// are dropped by the state guard.
    pub async fn complete(
        &self,
        execution_id: &Uuid,
        response: ExecutorResponse,
    ) -> Result<bool, DispatchError> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(false);
        };
        if execution.state != ExecutionState::Started || !response.finished {
            return Ok(false);
        }
        let (result, reason) = outcome(&response);
        self.finalize(&execution, result, reason, None, response.outputs)
            .await
    }

    /// Convert an inbound backend callback into a completion.
    pub async fn handle_webhook(
        &self,
        execution_id: &Uuid,
        payload: &Value,
    ) -> Result<bool, DispatchError> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(false);
        };
        let NodeConfiguration::Component { spec } = &execution.configuration else {
            return Ok(false);
        };
        match self.executor.handle_webhook(spec, payload).await {
            Ok(response) => self.complete(execution_id, response).await,
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "webhook rejected");
                Ok(false)
            }
        }
    }

    /// Poll async backends for every STARTED execution with a backend id.
    ///
    /// A crash mid-call leaves an execution STARTED; this pass recovers it.
    /// Transient conditions are retried next pass, not surfaced as failures.
    pub async fn reconcile_once(&self) -> Result<usize, DispatchError> {
        let mut completed = 0;
        for execution in self.store.started_with_backend_id().await? {
            let NodeConfiguration::Component { spec } = &execution.configuration else {
                continue;
            };
            let Some(backend_id) = execution.backend_id.clone() else {
                continue;
            };
            match self.executor.check(spec, &backend_id).await {
                Ok(response) if response.finished => {
                    if self.complete(&execution.id, response).await? {
                        completed += 1;
                    }
                }
                Ok(_) => {}
                Err(ExecutorError::Transient(message)) => {
                    tracing::debug!(
                        execution_id = %execution.id,
                        message = message.as_str(),
                        "transient check condition; retrying next pass"
                    );
                }
                Err(e) => {
                    self.fail(&execution, e.to_string()).await?;
                }
            }
        }
        Ok(completed)
    }

    /// Finalize as FAILED/ERROR with a preserved message.
    async fn fail(&self, execution: &Execution, message: String) -> Result<(), DispatchError> {
        self.finalize(
            execution,
            ExecutionResult::Failed,
            ResultReason::Error,
            Some(message),
            Map::new(),
        )
        .await?;
        Ok(())
    }

    /// The single first-completion-wins transition.
    ///
    /// On a win: frees the node, emits the output event for passed runs, and
    /// drains any blueprint ancestors whose internal runs just completed.
    async fn finalize(
        &self,
        execution: &Execution,
        result: ExecutionResult,
        reason: ResultReason,
        message: Option<String>,
        outputs: Map<String, Value>,
    ) -> Result<bool, DispatchError> {
        let won = self
            .store
            .finish_execution(&execution.id, result, reason, message.as_deref(), &outputs)
            .await?;
        if !won {
            return Ok(false);
        }

        tracing::info!(
            execution_id = %execution.id,
            result = ?result,
            "execution finished"
        );
        self.store.release_node(&execution.node_id).await?;

        if result == ExecutionResult::Passed {
            if let Some(node) = self.store.get_node(&execution.node_id).await? {
                self.router
                    .emit(output_event(&node, execution, outputs))
                    .await?;
            }
        }

        self.drain_ancestors(execution.parent_execution_id).await?;
        Ok(true)
    }

    /// Walk up the blueprint parent chain, finalizing every parent whose
    /// internal run has fully drained (no non-finished children, no internal
    /// backlog).
    async fn drain_ancestors(&self, mut next: Option<Uuid>) -> Result<(), DispatchError> {
        while let Some(parent_id) = next {
            let Some(parent) = self.store.get_execution(&parent_id).await? else {
                break;
            };
            if parent.state != ExecutionState::Started {
                break;
            }

            let children = self.store.list_child_executions(&parent_id).await?;
            if children.iter().any(|c| !c.is_finished()) {
                break;
            }
            let internal = self.store.list_internal_nodes(&parent.node_id).await?;
            let mut backlog = false;
            for internal_node in &internal {
                if self.store.queue_depth(&internal_node.id).await? > 0 {
                    backlog = true;
                    break;
                }
            }
            if backlog {
                break;
            }

            let failed = children
                .iter()
                .any(|c| c.result == Some(ExecutionResult::Failed));
            let (result, reason, message) = if failed {
                (
                    ExecutionResult::Failed,
                    ResultReason::Error,
                    Some("internal execution failed".to_string()),
                )
            } else {
                (ExecutionResult::Passed, ResultReason::Ok, None)
            };

            // Union of internal outputs, keyed by internal node short name.
            let mut outputs = Map::new();
            for child in &children {
                if child.outputs.is_empty() {
                    continue;
                }
                let key = match self.store.get_node(&child.node_id).await? {
                    Some(node) => Node::split_namespaced(&node.name)
                        .map(|(_, short)| short.to_string())
                        .unwrap_or(node.name),
                    None => child.node_id.to_string(),
                };
                outputs.insert(key, Value::Object(child.outputs.clone()));
            }

            let won = self
                .store
                .finish_execution(&parent_id, result, reason, message.as_deref(), &outputs)
                .await?;
            if !won {
                break;
            }
            tracing::info!(
                execution_id = %parent_id,
                result = ?result,
                "blueprint execution finished"
            );
            self.store.release_node(&parent.node_id).await?;

            if result == ExecutionResult::Passed {
                if let Some(node) = self.store.get_node(&parent.node_id).await? {
                    self.router
                        .emit(output_event(&node, &parent, outputs))
                        .await?;
                }
            }

            next = parent.parent_execution_id;
        }
        Ok(())
    }
}

/// Map a finished response onto a result/reason pair.
fn outcome(response: &ExecutorResponse) -> (ExecutionResult, ResultReason) {
    if response.successful {
        (ExecutionResult::Passed, ResultReason::Ok)
    } else {
        (ExecutionResult::Failed, ResultReason::Error)
    }
}

/// The output event a passed execution emits on the default channel.
fn output_event(node: &Node, execution: &Execution, outputs: Map<String, Value>) -> Event {
    Event {
        id: Uuid::now_v7(),
        canvas_id: node.canvas_id,
        origin: EventOrigin::Node,
        source_id: node.id,
        channel: DEFAULT_CHANNEL.to_string(),
        event_type: EVENT_TYPE_PASSED.to_string(),
        payload: Value::Object(outputs),
        display_name: None,
        root_id: execution.root_event_id,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
