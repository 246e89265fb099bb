//! Execution records: one run of a node against one input event.
//!
//! The execution state machine is PENDING -> STARTED -> FINISHED with a
//! result of passed/failed/cancelled. Transitions are persisted with state
//! guards so the synchronous completion path, the polling path, and the
//! webhook path feed one idempotent first-completion-wins transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::node::NodeConfiguration;

// ---------------------------------------------------------------------------
// State, result, reason
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Started,
    Finished,
}

/// Terminal outcome, set when the execution reaches FINISHED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Passed,
    Failed,
    Cancelled,
}

/// Why the result is what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultReason {
    Ok,
    Error,
    /// An operator acknowledged a failed execution; changes only the reason,
    /// never the result, and does not re-trigger execution.
    ErrorResolved,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// The unit "node N processes input event E".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub node_id: Uuid,
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_reason: Option<ResultReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_message: Option<String>,
    /// Structured outputs reported by the backend, merged into the output event.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Top of the causal chain this execution belongs to.
    pub root_event_id: Uuid,
    pub input_event_id: Uuid,
    /// Set only for blueprint-internal children; a child can only be
    /// cancelled by cancelling its parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    /// Per-node history chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
    /// Raw configuration snapshot at dispatch time; resolved values are
    /// never persisted.
    pub configuration: NodeConfiguration,
    /// Backend correlation id for later `check` calls (async backends only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Build a fresh PENDING execution.
    pub fn pending(
        node_id: Uuid,
        configuration: NodeConfiguration,
        root_event_id: Uuid,
        input_event_id: Uuid,
        parent_execution_id: Option<Uuid>,
        previous_execution_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            node_id,
            state: ExecutionState::Pending,
            result: None,
            result_reason: None,
            result_message: None,
            outputs: Map::new(),
            root_event_id,
            input_event_id,
            parent_execution_id,
            previous_execution_id,
            cancelled_by: None,
            configuration,
            backend_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == ExecutionState::Finished
    }

    /// Whether this is a blueprint-internal child execution.
    pub fn is_child(&self) -> bool {
        self.parent_execution_id.is_some()
    }

    pub fn failed_with_error(&self) -> bool {
        self.result == Some(ExecutionResult::Failed)
            && self.result_reason == Some(ResultReason::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
