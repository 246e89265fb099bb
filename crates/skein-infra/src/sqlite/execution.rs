//! SQLite execution repository implementation.
//!
//! Two invariants live here, in persisted state rather than process memory:
//! the partial unique index on non-finished executions per node (enforced
//! by `try_create_execution` reporting the constraint violation as a lost
//! race), and the first-completion-wins finish guard. Cascade cancellation
//! runs a recursive CTE over the children-by-parent index inside one
//! transaction, so partial cascades are never observable.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use skein_core::repository::ExecutionRepository;
use skein_types::error::RepositoryError;
use skein_types::execution::{Execution, ExecutionResult, ExecutionState, ResultReason};
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteStore, enum_from_str, enum_str, format_datetime, is_unique_violation, json_from_str,
    json_to_string, parse_datetime, parse_uuid, query_err,
};

// ---------------------------------------------------------------------------
// Row type
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    node_id: String,
    state: String,
    result: Option<String>,
    result_reason: Option<String>,
    result_message: Option<String>,
    outputs: String,
    root_event_id: String,
    input_event_id: String,
    parent_execution_id: Option<String>,
    previous_execution_id: Option<String>,
    cancelled_by: Option<String>,
    configuration: String,
    backend_id: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            state: row.try_get("state")?,
            result: row.try_get("result")?,
            result_reason: row.try_get("result_reason")?,
            result_message: row.try_get("result_message")?,
            outputs: row.try_get("outputs")?,
            root_event_id: row.try_get("root_event_id")?,
            input_event_id: row.try_get("input_event_id")?,
            parent_execution_id: row.try_get("parent_execution_id")?,
            previous_execution_id: row.try_get("previous_execution_id")?,
            cancelled_by: row.try_get("cancelled_by")?,
            configuration: row.try_get("configuration")?,
            backend_id: row.try_get("backend_id")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let state: ExecutionState = enum_from_str(&self.state, "execution state")?;
        let result: Option<ExecutionResult> = self
            .result
            .as_deref()
            .map(|s| enum_from_str(s, "execution result"))
            .transpose()?;
        let result_reason: Option<ResultReason> = self
            .result_reason
            .as_deref()
            .map(|s| enum_from_str(s, "result reason"))
            .transpose()?;
        let outputs: Map<String, Value> = json_from_str(&self.outputs, "execution outputs")?;
        Ok(Execution {
            id: parse_uuid(&self.id)?,
            node_id: parse_uuid(&self.node_id)?,
            state,
            result,
            result_reason,
            result_message: self.result_message,
            outputs,
            root_event_id: parse_uuid(&self.root_event_id)?,
            input_event_id: parse_uuid(&self.input_event_id)?,
            parent_execution_id: self
                .parent_execution_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            previous_execution_id: self
                .previous_execution_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            cancelled_by: self.cancelled_by,
            configuration: json_from_str(&self.configuration, "execution configuration")?,
            backend_id: self.backend_id,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

const SELECT_EXECUTION: &str = "SELECT id, node_id, state, result, result_reason, result_message, outputs, root_event_id, input_event_id, parent_execution_id, previous_execution_id, cancelled_by, configuration, backend_id, created_at, started_at, finished_at FROM executions";

fn rows_to_executions(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Execution>, RepositoryError> {
    let mut executions = Vec::with_capacity(rows.len());
    for row in &rows {
        executions.push(ExecutionRow::from_row(row).map_err(query_err)?.into_execution()?);
    }
    Ok(executions)
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteStore {
    async fn try_create_execution(&self, execution: &Execution) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO executions
               (id, node_id, state, result, result_reason, result_message, outputs,
                root_event_id, input_event_id, parent_execution_id, previous_execution_id,
                cancelled_by, configuration, backend_id, created_at, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.node_id.to_string())
        .bind(enum_str(&execution.state)?)
        .bind(execution.result.as_ref().map(enum_str).transpose()?)
        .bind(execution.result_reason.as_ref().map(enum_str).transpose()?)
        .bind(&execution.result_message)
        .bind(json_to_string(&execution.outputs, "execution outputs")?)
        .bind(execution.root_event_id.to_string())
        .bind(execution.input_event_id.to_string())
        .bind(execution.parent_execution_id.map(|id| id.to_string()))
        .bind(execution.previous_execution_id.map(|id| id.to_string()))
        .bind(&execution.cancelled_by)
        .bind(json_to_string(&execution.configuration, "execution configuration")?)
        .bind(&execution.backend_id)
        .bind(format_datetime(&execution.created_at))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.finished_at.as_ref().map(format_datetime))
        .execute(self.writer())
        .await;

        match result {
            Ok(_) => Ok(true),
            // The single-active partial unique index held the insert back.
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_EXECUTION} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.reader())
            .await
            .map_err(query_err)?;
        match row {
            Some(row) => Ok(Some(
                ExecutionRow::from_row(&row).map_err(query_err)?.into_execution()?,
            )),
            None => Ok(None),
        }
    }

    async fn mark_started(
        &self,
        id: &Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE executions SET state = 'started', started_at = ? WHERE id = ? AND state = 'pending'",
        )
        .bind(format_datetime(&started_at))
        .bind(id.to_string())
        .execute(self.writer())
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_backend_id(&self, id: &Uuid, backend_id: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE executions SET backend_id = ? WHERE id = ?")
            .bind(backend_id)
            .bind(id.to_string())
            .execute(self.writer())
            .await
            .map_err(query_err)?;
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
        let updated = sqlx::query(
            r#"UPDATE executions
               SET state = 'finished', result = ?, result_reason = ?, result_message = ?,
                   outputs = ?, finished_at = ?
               WHERE id = ? AND state != 'finished'"#,
        )
        .bind(enum_str(&result)?)
        .bind(enum_str(&reason)?)
        .bind(message)
        .bind(json_to_string(outputs, "execution outputs")?)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(self.writer())
        .await
        .map_err(query_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn cancel_cascade(
        &self,
        root_id: &Uuid,
        cancelled_by: &str,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut tx = self.writer().begin().await.map_err(query_err)?;

        let exists = sqlx::query("SELECT 1 FROM executions WHERE id = ?")
            .bind(root_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;
        if exists.is_none() {
            return Err(RepositoryError::NotFound);
        }

        // Collect the root and every transitive descendant that is still
        // running, then finalize them all inside this transaction.
        let target_rows = sqlx::query(
            r#"WITH RECURSIVE descendants(id) AS (
                 SELECT id FROM executions WHERE id = ?
                 UNION ALL
                 SELECT e.id FROM executions e
                 JOIN descendants d ON e.parent_execution_id = d.id
               )
               SELECT id FROM executions
               WHERE id IN (SELECT id FROM descendants) AND state != 'finished'"#,
        )
        .bind(root_id.to_string())
        .fetch_all(&mut *tx)
        .await
        .map_err(query_err)?;

        let now = format_datetime(&Utc::now());
        let mut ids = Vec::with_capacity(target_rows.len());
        for row in &target_rows {
            let id: String = row.try_get("id").map_err(query_err)?;
            sqlx::query(
                r#"UPDATE executions
                   SET state = 'finished', result = 'cancelled', result_reason = 'ok',
                       cancelled_by = ?, finished_at = ?
                   WHERE id = ?"#,
            )
            .bind(cancelled_by)
            .bind(&now)
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
            ids.push(id);
        }

        let mut finalized = Vec::with_capacity(ids.len());
        for id in &ids {
            let row = sqlx::query(&format!("{SELECT_EXECUTION} WHERE id = ?"))
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(query_err)?;
            finalized.push(ExecutionRow::from_row(&row).map_err(query_err)?.into_execution()?);
        }

        tx.commit().await.map_err(query_err)?;
        Ok(finalized)
    }

    async fn resolve_error(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE executions SET result_reason = 'error_resolved'
               WHERE id = ? AND state = 'finished' AND result = 'failed'
                 AND result_reason = 'error'"#,
        )
        .bind(id.to_string())
        .execute(self.writer())
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_execution(&self, node_id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_EXECUTION} WHERE node_id = ? AND state != 'finished' LIMIT 1"
        ))
        .bind(node_id.to_string())
        .fetch_optional(self.reader())
        .await
        .map_err(query_err)?;
        match row {
            Some(row) => Ok(Some(
                ExecutionRow::from_row(&row).map_err(query_err)?.into_execution()?,
            )),
            None => Ok(None),
        }
    }

    async fn latest_execution_id(&self, node_id: &Uuid) -> Result<Option<Uuid>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id FROM executions WHERE node_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(node_id.to_string())
        .fetch_optional(self.reader())
        .await
        .map_err(query_err)?;
        match row {
            Some(row) => {
                let id: String = row.try_get("id").map_err(query_err)?;
                Ok(Some(parse_uuid(&id)?))
            }
            None => Ok(None),
        }
    }

    async fn list_child_executions(
        &self,
        parent_execution_id: &Uuid,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EXECUTION} WHERE parent_execution_id = ? ORDER BY id"
        ))
        .bind(parent_execution_id.to_string())
        .fetch_all(self.reader())
        .await
        .map_err(query_err)?;
        rows_to_executions(rows)
    }

    async fn started_with_backend_id(&self) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EXECUTION} WHERE state = 'started' AND backend_id IS NOT NULL ORDER BY id"
        ))
        .fetch_all(self.reader())
        .await
        .map_err(query_err)?;
        rows_to_executions(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
