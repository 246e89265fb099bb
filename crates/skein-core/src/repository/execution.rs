//! Execution repository trait definition.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use skein_types::error::RepositoryError;
use skein_types::execution::{Execution, ExecutionResult, ResultReason};
use uuid::Uuid;

/// Repository trait for execution persistence.
///
/// The single-active-execution-per-node invariant and the
/// first-completion-wins finish are both enforced here, in persisted state,
/// so any worker instance may dispatch or complete an execution.
pub trait ExecutionRepository: Send + Sync {
    /// Insert a PENDING execution, enforcing at most one non-finished
    /// execution per node.
    ///
    /// Returns `false` when the invariant holds the insert back (another
    /// non-finished execution exists for the node).
    fn try_create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Guarded PENDING -> STARTED. Returns `true` on transition.
    fn mark_started(
        &self,
        id: &Uuid,
        started_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Record the backend correlation id for a started async execution.
    fn record_backend_id(
        &self,
        id: &Uuid,
        backend_id: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Guarded finish: any non-finished state -> FINISHED with the given
    /// result. First completion wins; a second caller gets `false` and the
    /// stored row is untouched.
    fn finish_execution(
        &self,
        id: &Uuid,
        result: ExecutionResult,
        reason: ResultReason,
        message: Option<&str>,
        outputs: &Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Cancel an execution and every transitive descendant (matched by
    /// parent_execution_id) in ONE atomic transaction. Only non-finished
    /// executions are finalized; already-finished ones are left untouched.
    ///
    /// Returns the executions that were finalized by this call.
    fn cancel_cascade(
        &self,
        root_id: &Uuid,
        cancelled_by: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Guarded ERROR -> ERROR_RESOLVED on a finished failed execution.
    /// Changes only the reason. Returns `true` on transition.
    fn resolve_error(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// The node's single non-finished execution, if any.
    fn active_execution(
        &self,
        node_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Most recent execution id for a node (history chain head).
    fn latest_execution_id(
        &self,
        node_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Uuid>, RepositoryError>> + Send;

    /// Direct children of a parent execution.
    fn list_child_executions(
        &self,
        parent_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// STARTED executions that recorded a backend id (reconciliation scan).
    fn started_with_backend_id(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;
}
