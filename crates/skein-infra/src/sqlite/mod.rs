//! SQLite repository implementations.
//!
//! `SqliteStore` implements every repository trait from `skein-core` over a
//! split reader/writer pool. Enum columns are stored as their serde names;
//! structured columns (configurations, payloads, filters) as JSON blobs;
//! timestamps as RFC 3339 text.

pub mod connection;
pub mod event;
pub mod execution;
pub mod group;
pub mod node;
pub mod pool;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use skein_types::error::RepositoryError;
use uuid::Uuid;

pub use pool::{DatabasePool, default_database_url};

/// SQLite-backed implementation of the full `Store` surface.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DatabasePool,
}

impl SqliteStore {
    /// Wrap an existing pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open (and migrate) the database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self::new(DatabasePool::new(database_url).await?))
    }

    pub(crate) fn reader(&self) -> &sqlx::SqlitePool {
        &self.pool.reader
    }

    pub(crate) fn writer(&self) -> &sqlx::SqlitePool {
        &self.pool.writer
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Serialize a unit-variant enum to its serde string name.
pub(crate) fn enum_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!(
            "enum did not serialize to a string: {other}"
        ))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

/// Parse a unit-variant enum from its serde string name.
pub(crate) fn enum_from_str<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

/// Parse a JSON blob column.
pub(crate) fn json_from_str<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

/// Serialize a JSON blob column.
pub(crate) fn json_to_string<T: Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

pub(crate) fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Whether an insert failed on a unique constraint (the loser of a
/// serialized race, not a hard error).
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
pub(crate) async fn test_store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
    let store = SqliteStore::connect(&url).await.unwrap();
    (dir, store)
}

/// Test helper: persist a minimal component node (queue items and
/// executions have foreign keys into `nodes`).
#[cfg(test)]
pub(crate) async fn seed_node(
    store: &SqliteStore,
    canvas_id: Uuid,
    name: &str,
) -> skein_types::node::Node {
    use skein_core::repository::NodeRepository;
    use skein_types::node::{Node, NodeConfiguration, NodeKind, NodeState};
    use skein_types::spec::ExecutorSpec;

    let now = Utc::now();
    let node = Node {
        id: Uuid::now_v7(),
        canvas_id,
        name: name.to_string(),
        kind: NodeKind::Component,
        state: NodeState::Ready,
        state_reason: None,
        parent_node_id: None,
        configuration: NodeConfiguration::Component {
            spec: ExecutorSpec::NoOp {},
        },
        deleted_at: None,
        created_at: now,
        updated_at: now,
    };
    store.upsert_node(&node).await.unwrap();
    node
}
