//! SQLite node repository implementation.
//!
//! State transitions are single guarded UPDATE statements on the writer
//! pool; the serialized writer is what makes check-then-set atomic (notably
//! `resume_node`, whose started-execution check and state write are one
//! statement).

use chrono::Utc;
use skein_core::repository::NodeRepository;
use skein_types::error::RepositoryError;
use skein_types::node::{Node, NodeConfiguration, NodeKind, NodeState};
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteStore, enum_from_str, enum_str, format_datetime, json_from_str, json_to_string,
    parse_datetime, parse_uuid, query_err,
};

// ---------------------------------------------------------------------------
// Row type
// ---------------------------------------------------------------------------

struct NodeRow {
    id: String,
    canvas_id: String,
    name: String,
    kind: String,
    state: String,
    state_reason: Option<String>,
    parent_node_id: Option<String>,
    configuration: String,
    deleted_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl NodeRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            canvas_id: row.try_get("canvas_id")?,
            name: row.try_get("name")?,
            kind: row.try_get("kind")?,
            state: row.try_get("state")?,
            state_reason: row.try_get("state_reason")?,
            parent_node_id: row.try_get("parent_node_id")?,
            configuration: row.try_get("configuration")?,
            deleted_at: row.try_get("deleted_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_node(self) -> Result<Node, RepositoryError> {
        let kind: NodeKind = enum_from_str(&self.kind, "node kind")?;
        let state: NodeState = enum_from_str(&self.state, "node state")?;
        let configuration: NodeConfiguration =
            json_from_str(&self.configuration, "node configuration")?;
        Ok(Node {
            id: parse_uuid(&self.id)?,
            canvas_id: parse_uuid(&self.canvas_id)?,
            name: self.name,
            kind,
            state,
            state_reason: self.state_reason,
            parent_node_id: self.parent_node_id.as_deref().map(parse_uuid).transpose()?,
            configuration,
            deleted_at: self.deleted_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

const SELECT_NODE: &str = "SELECT id, canvas_id, name, kind, state, state_reason, parent_node_id, configuration, deleted_at, created_at, updated_at FROM nodes";

fn rows_to_nodes(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Node>, RepositoryError> {
    let mut nodes = Vec::with_capacity(rows.len());
    for row in &rows {
        nodes.push(NodeRow::from_row(row).map_err(query_err)?.into_node()?);
    }
    Ok(nodes)
}

// ---------------------------------------------------------------------------
// NodeRepository impl
// ---------------------------------------------------------------------------

impl NodeRepository for SqliteStore {
    async fn upsert_node(&self, node: &Node) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO nodes
               (id, canvas_id, name, kind, state, state_reason, parent_node_id,
                configuration, deleted_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 state = excluded.state,
                 state_reason = excluded.state_reason,
                 configuration = excluded.configuration,
                 deleted_at = excluded.deleted_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(node.id.to_string())
        .bind(node.canvas_id.to_string())
        .bind(&node.name)
        .bind(enum_str(&node.kind)?)
        .bind(enum_str(&node.state)?)
        .bind(&node.state_reason)
        .bind(node.parent_node_id.map(|id| id.to_string()))
        .bind(json_to_string(&node.configuration, "node configuration")?)
        .bind(node.deleted_at.as_ref().map(format_datetime))
        .bind(format_datetime(&node.created_at))
        .bind(format_datetime(&node.updated_at))
        .execute(self.writer())
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_node(&self, id: &Uuid) -> Result<Option<Node>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_NODE} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.reader())
            .await
            .map_err(query_err)?;
        match row {
            Some(row) => Ok(Some(NodeRow::from_row(&row).map_err(query_err)?.into_node()?)),
            None => Ok(None),
        }
    }

    async fn get_node_by_name(
        &self,
        canvas_id: &Uuid,
        name: &str,
    ) -> Result<Option<Node>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_NODE} WHERE canvas_id = ? AND name = ? AND deleted_at IS NULL"
        ))
        .bind(canvas_id.to_string())
        .bind(name)
        .fetch_optional(self.reader())
        .await
        .map_err(query_err)?;
        match row {
            Some(row) => Ok(Some(NodeRow::from_row(&row).map_err(query_err)?.into_node()?)),
            None => Ok(None),
        }
    }

    async fn list_nodes(&self, canvas_id: &Uuid) -> Result<Vec<Node>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_NODE} WHERE canvas_id = ? AND deleted_at IS NULL ORDER BY id"
        ))
        .bind(canvas_id.to_string())
        .fetch_all(self.reader())
        .await
        .map_err(query_err)?;
        rows_to_nodes(rows)
    }

    async fn list_internal_nodes(
        &self,
        parent_node_id: &Uuid,
    ) -> Result<Vec<Node>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_NODE} WHERE parent_node_id = ? AND deleted_at IS NULL ORDER BY id"
        ))
        .bind(parent_node_id.to_string())
        .fetch_all(self.reader())
        .await
        .map_err(query_err)?;
        rows_to_nodes(rows)
    }

    async fn set_node_state(
        &self,
        id: &Uuid,
        state: NodeState,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE nodes SET state = ?, state_reason = ?, updated_at = ? WHERE id = ?")
            .bind(enum_str(&state)?)
            .bind(reason)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(self.writer())
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn pause_node(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE nodes SET state = 'paused', updated_at = ?
               WHERE id = ? AND deleted_at IS NULL
                 AND state IN ('ready', 'processing', 'paused')"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(self.writer())
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn resume_node(&self, id: &Uuid) -> Result<Option<NodeState>, RepositoryError> {
        // The started-execution check and the state write are one statement
        // on the serialized writer, so a concurrent dequeue cannot slip
        // between the check and the set.
        let result = sqlx::query(
            r#"UPDATE nodes SET
                 state = CASE WHEN EXISTS (
                   SELECT 1 FROM executions
                   WHERE executions.node_id = nodes.id AND executions.state = 'started'
                 ) THEN 'processing' ELSE 'ready' END,
                 updated_at = ?
               WHERE id = ? AND state = 'paused'"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(self.writer())
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let row = sqlx::query("SELECT state FROM nodes WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(self.writer())
            .await
            .map_err(query_err)?;
        let state: String = row.try_get("state").map_err(query_err)?;
        Ok(Some(enum_from_str(&state, "node state")?))
    }

    async fn occupy_node(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("UPDATE nodes SET state = 'processing', updated_at = ? WHERE id = ? AND state = 'ready'")
                .bind(format_datetime(&Utc::now()))
                .bind(id.to_string())
                .execute(self.writer())
                .await
                .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_node(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("UPDATE nodes SET state = 'ready', updated_at = ? WHERE id = ? AND state = 'processing'")
                .bind(format_datetime(&Utc::now()))
                .bind(id.to_string())
                .execute(self.writer())
                .await
                .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete_node(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("UPDATE nodes SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL")
                .bind(format_datetime(&Utc::now()))
                .bind(format_datetime(&Utc::now()))
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
