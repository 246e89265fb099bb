//! Event and queue-item repository trait definition.

use skein_types::error::RepositoryError;
use skein_types::event::{Event, QueueItem};
use uuid::Uuid;

/// Repository trait for events and per-node queues.
///
/// Events are immutable: created once, read many times, never updated or
/// deleted. Queue items are created on connection match and deleted on
/// dequeue.
pub trait EventRepository: Send + Sync {
    /// Persist an immutable event record.
    fn create_event(
        &self,
        event: &Event,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_event(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Event>, RepositoryError>> + Send;

    /// Append an item to a node's queue.
    fn enqueue(
        &self,
        item: &QueueItem,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Oldest queue item for a node (by created_at, id).
    fn queue_head(
        &self,
        node_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<QueueItem>, RepositoryError>> + Send;

    /// Consume a queue item. Returns `false` if another worker already did.
    fn delete_queue_item(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Number of items waiting for a node.
    fn queue_depth(
        &self,
        node_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Distinct node ids that currently have queued items.
    fn nodes_with_backlog(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;
}
