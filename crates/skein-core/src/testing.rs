//! In-memory fixtures for engine tests.
//!
//! `InMemoryStore` implements the full repository surface behind a single
//! mutex, mirroring the guarded-transition semantics the SQLite adapter
//! provides (state-guarded updates, unique-constraint behavior, atomic
//! cascade). `StubExecutor` records calls and replays scripted responses.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use skein_types::connection::{Connection, ConnectionTarget};
use skein_types::error::RepositoryError;
use skein_types::event::{Event, EventOrigin, QueueItem};
use skein_types::execution::{Execution, ExecutionResult, ExecutionState, ResultReason};
use skein_types::group::{ConnectionGroup, FieldSet, FieldSetResult, FieldSetSlot, FieldSetState};
use skein_types::node::{Node, NodeState};
use skein_types::spec::ExecutorSpec;
use uuid::Uuid;

use crate::executor::{
    BindingError, BindingProvider, ExecutionParameters, Executor, ExecutorError, ExecutorResponse,
    TokenSigner, ValidationError, validate_spec,
};
use crate::expression::Bindings;
use crate::repository::{
    ConnectionRepository, EventRepository, ExecutionRepository, GroupRepository, NodeRepository,
};

// ---------------------------------------------------------------------------
// InMemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    nodes: HashMap<Uuid, Node>,
    events: HashMap<Uuid, Event>,
    queue: Vec<QueueItem>,
    executions: HashMap<Uuid, Execution>,
    groups: HashMap<Uuid, ConnectionGroup>,
    field_sets: HashMap<Uuid, FieldSet>,
    slots: Vec<FieldSetSlot>,
    connections: HashMap<Uuid, Connection>,
}

/// Mutex-backed store implementing every repository trait.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("store mutex poisoned")
    }

    /// Test helper: the join-key hash of a field set by id.
    pub fn field_set_hash_for_test(&self, field_set_id: &Uuid) -> String {
        self.lock()
            .field_sets
            .get(field_set_id)
            .map(|fs| fs.hash.clone())
            .unwrap_or_default()
    }

    /// Test helper: all executions, sorted by creation.
    pub fn all_executions_for_test(&self) -> Vec<Execution> {
        let mut executions: Vec<Execution> = self.lock().executions.values().cloned().collect();
        executions.sort_by_key(|e| e.id);
        executions
    }
}

impl NodeRepository for InMemoryStore {
    async fn upsert_node(&self, node: &Node) -> Result<(), RepositoryError> {
        self.lock().nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get_node(&self, id: &Uuid) -> Result<Option<Node>, RepositoryError> {
        Ok(self.lock().nodes.get(id).cloned())
    }

    async fn get_node_by_name(
        &self,
        canvas_id: &Uuid,
        name: &str,
    ) -> Result<Option<Node>, RepositoryError> {
        Ok(self
            .lock()
            .nodes
            .values()
            .find(|n| n.canvas_id == *canvas_id && n.name == name && !n.is_deleted())
            .cloned())
    }

    async fn list_nodes(&self, canvas_id: &Uuid) -> Result<Vec<Node>, RepositoryError> {
        let mut nodes: Vec<Node> = self
            .lock()
            .nodes
            .values()
            .filter(|n| n.canvas_id == *canvas_id && !n.is_deleted())
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn list_internal_nodes(
        &self,
        parent_node_id: &Uuid,
    ) -> Result<Vec<Node>, RepositoryError> {
        let mut nodes: Vec<Node> = self
            .lock()
            .nodes
            .values()
            .filter(|n| n.parent_node_id == Some(*parent_node_id) && !n.is_deleted())
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn set_node_state(
        &self,
        id: &Uuid,
        state: NodeState,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut guard = self.lock();
        let node = guard.nodes.get_mut(id).ok_or(RepositoryError::NotFound)?;
        node.state = state;
        node.state_reason = reason.map(str::to_string);
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn pause_node(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let Some(node) = guard.nodes.get_mut(id) else {
            return Ok(false);
        };
        if node.is_deleted() || node.state == NodeState::Error {
            return Ok(false);
        }
        node.state = NodeState::Paused;
        node.updated_at = Utc::now();
        Ok(true)
    }

    async fn resume_node(&self, id: &Uuid) -> Result<Option<NodeState>, RepositoryError> {
        let mut guard = self.lock();
        let has_started = guard
            .executions
            .values()
            .any(|e| e.node_id == *id && e.state == ExecutionState::Started);
        let Some(node) = guard.nodes.get_mut(id) else {
            return Ok(None);
        };
        if node.state != NodeState::Paused {
            return Ok(None);
        }
        node.state = if has_started {
            NodeState::Processing
        } else {
            NodeState::Ready
        };
        node.updated_at = Utc::now();
        Ok(Some(node.state))
    }

    async fn occupy_node(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let Some(node) = guard.nodes.get_mut(id) else {
            return Ok(false);
        };
        if node.state != NodeState::Ready {
            return Ok(false);
        }
        node.state = NodeState::Processing;
        node.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_node(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let Some(node) = guard.nodes.get_mut(id) else {
            return Ok(false);
        };
        if node.state != NodeState::Processing {
            return Ok(false);
        }
        node.state = NodeState::Ready;
        node.updated_at = Utc::now();
        Ok(true)
    }

    async fn soft_delete_node(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let Some(node) = guard.nodes.get_mut(id) else {
            return Ok(false);
        };
        if node.is_deleted() {
            return Ok(false);
        }
        node.deleted_at = Some(Utc::now());
        Ok(true)
    }
}

impl EventRepository for InMemoryStore {
    async fn create_event(&self, event: &Event) -> Result<(), RepositoryError> {
        self.lock().events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_event(&self, id: &Uuid) -> Result<Option<Event>, RepositoryError> {
        Ok(self.lock().events.get(id).cloned())
    }

    async fn enqueue(&self, item: &QueueItem) -> Result<(), RepositoryError> {
        self.lock().queue.push(item.clone());
        Ok(())
    }

    async fn queue_head(&self, node_id: &Uuid) -> Result<Option<QueueItem>, RepositoryError> {
        Ok(self
            .lock()
            .queue
            .iter()
            .filter(|i| i.node_id == *node_id)
            .min_by_key(|i| (i.created_at, i.id))
            .cloned())
    }

    async fn delete_queue_item(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let before = guard.queue.len();
        guard.queue.retain(|i| i.id != *id);
        Ok(guard.queue.len() < before)
    }

    async fn queue_depth(&self, node_id: &Uuid) -> Result<u64, RepositoryError> {
        Ok(self
            .lock()
            .queue
            .iter()
            .filter(|i| i.node_id == *node_id)
            .count() as u64)
    }

    async fn nodes_with_backlog(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let mut ids: Vec<Uuid> = self.lock().queue.iter().map(|i| i.node_id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

impl ExecutionRepository for InMemoryStore {
    async fn try_create_execution(&self, execution: &Execution) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let busy = guard
            .executions
            .values()
            .any(|e| e.node_id == execution.node_id && e.state != ExecutionState::Finished);
        if busy {
            return Ok(false);
        }
        guard.executions.insert(execution.id, execution.clone());
        Ok(true)
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.lock().executions.get(id).cloned())
    }

    async fn mark_started(
        &self,
        id: &Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let Some(execution) = guard.executions.get_mut(id) else {
            return Ok(false);
        };
        if execution.state != ExecutionState::Pending {
            return Ok(false);
        }
        execution.state = ExecutionState::Started;
        execution.started_at = Some(started_at);
        Ok(true)
    }

    async fn record_backend_id(&self, id: &Uuid, backend_id: &str) -> Result<(), RepositoryError> {
        let mut guard = self.lock();
        let execution = guard.executions.get_mut(id).ok_or(RepositoryError::NotFound)?;
        execution.backend_id = Some(backend_id.to_string());
        Ok(())
    }

    async fn finish_execution(
        &self,
        id: &Uuid,
        result: ExecutionResult,
        reason: ResultReason,
        message: Option<&str>,
        outputs: &Map<String, Value>,
    ) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let Some(execution) = guard.executions.get_mut(id) else {
            return Ok(false);
        };
        if execution.state == ExecutionState::Finished {
            return Ok(false);
        }
        execution.state = ExecutionState::Finished;
        execution.result = Some(result);
        execution.result_reason = Some(reason);
        execution.result_message = message.map(str::to_string);
        execution.outputs = outputs.clone();
        execution.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn cancel_cascade(
        &self,
        root_id: &Uuid,
        cancelled_by: &str,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut guard = self.lock();
        if !guard.executions.contains_key(root_id) {
            return Err(RepositoryError::NotFound);
        }

        // Depth-first collection over the children-by-parent index.
        let mut targets = vec![*root_id];
        let mut frontier = vec![*root_id];
        while let Some(parent) = frontier.pop() {
            let children: Vec<Uuid> = guard
                .executions
                .values()
                .filter(|e| e.parent_execution_id == Some(parent))
                .map(|e| e.id)
                .collect();
            for child in children {
                targets.push(child);
                frontier.push(child);
            }
        }

        let now = Utc::now();
        let mut finalized = Vec::new();
        for id in targets {
            let execution = guard.executions.get_mut(&id).expect("collected above");
            if execution.state == ExecutionState::Finished {
                continue;
            }
            execution.state = ExecutionState::Finished;
            execution.result = Some(ExecutionResult::Cancelled);
            execution.result_reason = Some(ResultReason::Ok);
            execution.cancelled_by = Some(cancelled_by.to_string());
            execution.finished_at = Some(now);
            finalized.push(execution.clone());
        }
        Ok(finalized)
    }

    async fn resolve_error(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let Some(execution) = guard.executions.get_mut(id) else {
            return Ok(false);
        };
        if !execution.failed_with_error() {
            return Ok(false);
        }
        execution.result_reason = Some(ResultReason::ErrorResolved);
        Ok(true)
    }

    async fn active_execution(
        &self,
        node_id: &Uuid,
    ) -> Result<Option<Execution>, RepositoryError> {
        Ok(self
            .lock()
            .executions
            .values()
            .find(|e| e.node_id == *node_id && e.state != ExecutionState::Finished)
            .cloned())
    }

    async fn latest_execution_id(&self, node_id: &Uuid) -> Result<Option<Uuid>, RepositoryError> {
        Ok(self
            .lock()
            .executions
            .values()
            .filter(|e| e.node_id == *node_id)
            .max_by_key(|e| e.id)
            .map(|e| e.id))
    }

    async fn list_child_executions(
        &self,
        parent_execution_id: &Uuid,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut children: Vec<Execution> = self
            .lock()
            .executions
            .values()
            .filter(|e| e.parent_execution_id == Some(*parent_execution_id))
            .cloned()
            .collect();
        children.sort_by_key(|e| e.id);
        Ok(children)
    }

    async fn started_with_backend_id(&self) -> Result<Vec<Execution>, RepositoryError> {
        let mut executions: Vec<Execution> = self
            .lock()
            .executions
            .values()
            .filter(|e| e.state == ExecutionState::Started && e.backend_id.is_some())
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.id);
        Ok(executions)
    }
}

impl GroupRepository for InMemoryStore {
    async fn upsert_group(&self, group: &ConnectionGroup) -> Result<(), RepositoryError> {
        self.lock().groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn get_group(&self, id: &Uuid) -> Result<Option<ConnectionGroup>, RepositoryError> {
        Ok(self.lock().groups.get(id).cloned())
    }

    async fn soft_delete_group(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let Some(group) = guard.groups.get_mut(id) else {
            return Ok(false);
        };
        if group.is_deleted() {
            return Ok(false);
        }
        group.deleted_at = Some(Utc::now());
        Ok(true)
    }

    async fn find_field_set(
        &self,
        group_id: &Uuid,
        hash: &str,
    ) -> Result<Option<FieldSet>, RepositoryError> {
        Ok(self
            .lock()
            .field_sets
            .values()
            .find(|fs| fs.group_id == *group_id && fs.hash == hash)
            .cloned())
    }

    async fn try_create_field_set(&self, field_set: &FieldSet) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let conflict = guard
            .field_sets
            .values()
            .any(|fs| fs.group_id == field_set.group_id && fs.hash == field_set.hash);
        if conflict {
            return Ok(false);
        }
        guard.field_sets.insert(field_set.id, field_set.clone());
        Ok(true)
    }

    async fn upsert_slot(&self, slot: &FieldSetSlot) -> Result<(), RepositoryError> {
        let mut guard = self.lock();
        guard
            .slots
            .retain(|s| !(s.field_set_id == slot.field_set_id && s.connection_id == slot.connection_id && !s.late));
        guard.slots.push(slot.clone());
        Ok(())
    }

    async fn record_late_slot(&self, slot: &FieldSetSlot) -> Result<(), RepositoryError> {
        self.lock().slots.push(slot.clone());
        Ok(())
    }

    async fn list_slots(&self, field_set_id: &Uuid) -> Result<Vec<FieldSetSlot>, RepositoryError> {
        let mut slots: Vec<FieldSetSlot> = self
            .lock()
            .slots
            .iter()
            .filter(|s| s.field_set_id == *field_set_id && !s.late)
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.id);
        Ok(slots)
    }

    async fn finalize_field_set(
        &self,
        id: &Uuid,
        result: FieldSetResult,
        finalized_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut guard = self.lock();
        let Some(field_set) = guard.field_sets.get_mut(id) else {
            return Ok(false);
        };
        if field_set.state != FieldSetState::Pending {
            return Ok(false);
        }
        field_set.state = FieldSetState::Processed;
        field_set.result = Some(result);
        field_set.finalized_at = Some(finalized_at);
        Ok(true)
    }

    async fn overdue_field_sets(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FieldSet>, RepositoryError> {
        let guard = self.lock();
        let mut overdue: Vec<FieldSet> = guard
            .field_sets
            .values()
            .filter(|fs| {
                if fs.state != FieldSetState::Pending {
                    return false;
                }
                let Some(group) = guard.groups.get(&fs.group_id) else {
                    return false;
                };
                group.timeout_behavior != skein_types::group::TimeoutBehavior::None
                    && now >= group.deadline(fs.created_at)
            })
            .cloned()
            .collect();
        overdue.sort_by_key(|fs| fs.id);
        Ok(overdue)
    }
}

impl ConnectionRepository for InMemoryStore {
    async fn upsert_connection(&self, connection: &Connection) -> Result<(), RepositoryError> {
        self.lock().connections.insert(connection.id, connection.clone());
        Ok(())
    }

    async fn connections_from(
        &self,
        source_type: EventOrigin,
        source_id: &Uuid,
    ) -> Result<Vec<Connection>, RepositoryError> {
        let mut connections: Vec<Connection> = self
            .lock()
            .connections
            .values()
            .filter(|c| c.source_type == source_type && c.source_id == *source_id)
            .cloned()
            .collect();
        connections.sort_by_key(|c| c.id);
        Ok(connections)
    }

    async fn connections_into_node(
        &self,
        node_id: &Uuid,
    ) -> Result<Vec<Connection>, RepositoryError> {
        let mut connections: Vec<Connection> = self
            .lock()
            .connections
            .values()
            .filter(|c| c.target == ConnectionTarget::Node { id: *node_id })
            .cloned()
            .collect();
        connections.sort_by_key(|c| c.id);
        Ok(connections)
    }

    async fn connections_into_group(
        &self,
        group_id: &Uuid,
    ) -> Result<Vec<Connection>, RepositoryError> {
        let mut connections: Vec<Connection> = self
            .lock()
            .connections
            .values()
            .filter(|c| c.target == ConnectionTarget::Group { id: *group_id })
            .cloned()
            .collect();
        connections.sort_by_key(|c| c.id);
        Ok(connections)
    }

    async fn delete_connection(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.lock().connections.remove(id).is_some())
    }
}

// ---------------------------------------------------------------------------
// StubExecutor
// ---------------------------------------------------------------------------

/// Scripted executor: replays queued responses and records resolved specs.
#[derive(Default)]
pub struct StubExecutor {
    responses: Mutex<VecDeque<Result<ExecutorResponse, ExecutorError>>>,
    check_responses: Mutex<VecDeque<Result<ExecutorResponse, ExecutorError>>>,
    executed: Mutex<Vec<(ExecutorSpec, ExecutionParameters)>>,
}

impl StubExecutor {
    /// An executor whose every call completes successfully with no outputs.
    pub fn always_passing() -> Self {
        Self::default()
    }

    /// Queue the response for the next `execute` call.
    pub fn push_response(&self, response: Result<ExecutorResponse, ExecutorError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Queue the response for the next `check` call.
    pub fn push_check(&self, response: Result<ExecutorResponse, ExecutorError>) {
        self.check_responses.lock().unwrap().push_back(response);
    }

    /// Resolved specs passed to `execute`, in call order.
    pub fn executed_specs(&self) -> Vec<ExecutorSpec> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    /// Parameters passed to `execute`, in call order.
    pub fn executed_params(&self) -> Vec<ExecutionParameters> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(_, params)| params.clone())
            .collect()
    }
}

impl Executor for StubExecutor {
    fn validate(&self, spec: &ExecutorSpec) -> Result<(), ValidationError> {
        validate_spec(spec)
    }

    async fn execute(
        &self,
        spec: &ExecutorSpec,
        params: &ExecutionParameters,
    ) -> Result<ExecutorResponse, ExecutorError> {
        self.executed
            .lock()
            .unwrap()
            .push((spec.clone(), params.clone()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ExecutorResponse::completed(true, Map::new())))
    }

    async fn check(
        &self,
        _spec: &ExecutorSpec,
        backend_id: &str,
    ) -> Result<ExecutorResponse, ExecutorError> {
        self.check_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ExecutorResponse::in_progress(backend_id)))
    }

    async fn handle_webhook(
        &self,
        _spec: &ExecutorSpec,
        payload: &Value,
    ) -> Result<ExecutorResponse, ExecutorError> {
        // Mirrors the CI webhook shape: {"state": "done", "result": "passed"}.
        let finished = payload["state"] == "done";
        let successful = payload["result"] == "passed";
        if finished {
            Ok(ExecutorResponse::completed(successful, Map::new()))
        } else {
            Ok(ExecutorResponse {
                finished: false,
                successful: false,
                outputs: Map::new(),
                backend_id: None,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Bindings and signer stubs
// ---------------------------------------------------------------------------

/// Binding provider returning the same maps for every execution.
#[derive(Default)]
pub struct StaticBindings(pub Bindings);

impl BindingProvider for StaticBindings {
    async fn bindings_for(&self, _execution: &Execution) -> Result<Bindings, BindingError> {
        Ok(self.0.clone())
    }
}

/// Deterministic signer for tests.
pub struct StaticSigner;

impl TokenSigner for StaticSigner {
    fn token_for(&self, execution_id: &Uuid) -> String {
        format!("test-token-{execution_id}")
    }
}
