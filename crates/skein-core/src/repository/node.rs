//! Node repository trait definition.

use skein_types::error::RepositoryError;
use skein_types::node::{Node, NodeState};
use uuid::Uuid;

/// Repository trait for node persistence.
///
/// State transitions are expressed as guarded updates so that pause, resume,
/// dequeue, and finalization never lose updates to each other: each method
/// only transitions when the current state still matches its precondition
/// and reports whether it did.
pub trait NodeRepository: Send + Sync {
    /// Insert or replace a node by ID.
    fn upsert_node(
        &self,
        node: &Node,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a node by ID (including tombstoned nodes).
    fn get_node(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Node>, RepositoryError>> + Send;

    /// Get a live node by canvas-scoped name.
    fn get_node_by_name(
        &self,
        canvas_id: &Uuid,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Node>, RepositoryError>> + Send;

    /// List live nodes on a canvas.
    fn list_nodes(
        &self,
        canvas_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Node>, RepositoryError>> + Send;

    /// List live blueprint-internal nodes under a parent node.
    fn list_internal_nodes(
        &self,
        parent_node_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Node>, RepositoryError>> + Send;

    /// Unconditionally set a node's state and reason (canvas maintenance).
    fn set_node_state(
        &self,
        id: &Uuid,
        state: NodeState,
        reason: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Guarded pause: READY/PROCESSING/PAUSED -> PAUSED.
    ///
    /// Returns `true` if the node is now paused, `false` if the guard failed
    /// (node missing, tombstoned, or in ERROR).
    fn pause_node(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Atomic resume: PAUSED -> PROCESSING if a STARTED execution exists for
    /// the node, else PAUSED -> READY. The check and the write happen under
    /// the store's write lock so a concurrent dequeue cannot slip between.
    ///
    /// Returns the new state, or `None` if the node was not paused.
    fn resume_node(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<NodeState>, RepositoryError>> + Send;

    /// Guarded occupy on dispatch: READY -> PROCESSING.
    ///
    /// A pause racing in between wins (the node stays paused while its
    /// started execution runs out). Returns `true` on transition.
    fn occupy_node(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Guarded release after finalization: PROCESSING -> READY.
    ///
    /// A node paused mid-run stays paused. Returns `true` on transition.
    fn release_node(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Tombstone a node (and nothing else; execution history stays).
    /// Returns `true` if the node existed and was live.
    fn soft_delete_node(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
