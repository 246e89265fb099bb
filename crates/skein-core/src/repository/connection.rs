//! Connection repository trait definition.

use skein_types::connection::Connection;
use skein_types::error::RepositoryError;
use skein_types::event::EventOrigin;
use uuid::Uuid;

/// Repository trait for canvas edges.
pub trait ConnectionRepository: Send + Sync {
    fn upsert_connection(
        &self,
        connection: &Connection,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Connections whose source matches an event producer.
    fn connections_from(
        &self,
        source_type: EventOrigin,
        source_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Connection>, RepositoryError>> + Send;

    /// Connections delivering into a node (used for blueprint entry-node
    /// detection and canvas maintenance).
    fn connections_into_node(
        &self,
        node_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Connection>, RepositoryError>> + Send;

    /// Connections delivering into a connection group (the group's expected
    /// contributor set).
    fn connections_into_group(
        &self,
        group_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Connection>, RepositoryError>> + Send;

    /// Remove an edge. Returns `true` if it existed.
    fn delete_connection(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
