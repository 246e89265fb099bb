//! SQLite connection repository implementation.

use skein_core::repository::ConnectionRepository;
use skein_types::connection::{Connection, ConnectionFilter, ConnectionTarget, FilterOperator};
use skein_types::error::RepositoryError;
use skein_types::event::EventOrigin;
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteStore, enum_from_str, enum_str, json_from_str, json_to_string, parse_uuid, query_err,
};

// ---------------------------------------------------------------------------
// Row type
// ---------------------------------------------------------------------------

struct ConnectionRow {
    id: String,
    canvas_id: String,
    source_type: String,
    source_id: String,
    target_type: String,
    target_id: String,
    filters: String,
    filter_operator: String,
}

impl ConnectionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            canvas_id: row.try_get("canvas_id")?,
            source_type: row.try_get("source_type")?,
            source_id: row.try_get("source_id")?,
            target_type: row.try_get("target_type")?,
            target_id: row.try_get("target_id")?,
            filters: row.try_get("filters")?,
            filter_operator: row.try_get("filter_operator")?,
        })
    }

    fn into_connection(self) -> Result<Connection, RepositoryError> {
        let source_type: EventOrigin = enum_from_str(&self.source_type, "source type")?;
        let target_id = parse_uuid(&self.target_id)?;
        let target = match self.target_type.as_str() {
            "node" => ConnectionTarget::Node { id: target_id },
            "group" => ConnectionTarget::Group { id: target_id },
            other => {
                return Err(RepositoryError::Query(format!(
                    "invalid target type: {other}"
                )));
            }
        };
        let filters: Vec<ConnectionFilter> = json_from_str(&self.filters, "connection filters")?;
        let filter_operator: FilterOperator =
            enum_from_str(&self.filter_operator, "filter operator")?;
        Ok(Connection {
            id: parse_uuid(&self.id)?,
            canvas_id: parse_uuid(&self.canvas_id)?,
            source_type,
            source_id: parse_uuid(&self.source_id)?,
            target,
            filters,
            filter_operator,
        })
    }
}

fn target_parts(target: &ConnectionTarget) -> (&'static str, String) {
    match target {
        ConnectionTarget::Node { id } => ("node", id.to_string()),
        ConnectionTarget::Group { id } => ("group", id.to_string()),
    }
}

const SELECT_CONNECTION: &str = "SELECT id, canvas_id, source_type, source_id, target_type, target_id, filters, filter_operator FROM connections";

fn rows_to_connections(
    rows: Vec<sqlx::sqlite::SqliteRow>,
) -> Result<Vec<Connection>, RepositoryError> {
    let mut connections = Vec::with_capacity(rows.len());
    for row in &rows {
        connections.push(ConnectionRow::from_row(row).map_err(query_err)?.into_connection()?);
    }
    Ok(connections)
}

// ---------------------------------------------------------------------------
// ConnectionRepository impl
// ---------------------------------------------------------------------------

impl ConnectionRepository for SqliteStore {
    async fn upsert_connection(&self, connection: &Connection) -> Result<(), RepositoryError> {
        let (target_type, target_id) = target_parts(&connection.target);
        sqlx::query(
            r#"INSERT INTO connections
               (id, canvas_id, source_type, source_id, target_type, target_id, filters, filter_operator)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 source_type = excluded.source_type,
                 source_id = excluded.source_id,
                 target_type = excluded.target_type,
                 target_id = excluded.target_id,
                 filters = excluded.filters,
                 filter_operator = excluded.filter_operator"#,
        )
        .bind(connection.id.to_string())
        .bind(connection.canvas_id.to_string())
        .bind(enum_str(&connection.source_type)?)
        .bind(connection.source_id.to_string())
        .bind(target_type)
        .bind(target_id)
        .bind(json_to_string(&connection.filters, "connection filters")?)
        .bind(enum_str(&connection.filter_operator)?)
        .execute(self.writer())
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn connections_from(
        &self,
        source_type: EventOrigin,
        source_id: &Uuid,
    ) -> Result<Vec<Connection>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_CONNECTION} WHERE source_type = ? AND source_id = ? ORDER BY id"
        ))
        .bind(enum_str(&source_type)?)
        .bind(source_id.to_string())
        .fetch_all(self.reader())
        .await
        .map_err(query_err)?;
        rows_to_connections(rows)
    }

    async fn connections_into_node(
        &self,
        node_id: &Uuid,
    ) -> Result<Vec<Connection>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_CONNECTION} WHERE target_type = 'node' AND target_id = ? ORDER BY id"
        ))
        .bind(node_id.to_string())
        .fetch_all(self.reader())
        .await
        .map_err(query_err)?;
        rows_to_connections(rows)
    }

    async fn connections_into_group(
        &self,
        group_id: &Uuid,
    ) -> Result<Vec<Connection>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_CONNECTION} WHERE target_type = 'group' AND target_id = ? ORDER BY id"
        ))
        .bind(group_id.to_string())
        .fetch_all(self.reader())
        .await
        .map_err(query_err)?;
        rows_to_connections(rows)
    }

    async fn delete_connection(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(id.to_string())
            .execute(self.writer())
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
