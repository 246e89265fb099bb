//! SQLite connection-group repository implementation.
//!
//! The (group_id, hash) unique index serializes concurrent field-set
//! creation; `finalize_field_set` is the single-writer, state-guarded
//! update both the arrival path and the timeout sweep go through.

use chrono::{DateTime, Utc};
use skein_core::repository::GroupRepository;
use skein_types::error::RepositoryError;
use skein_types::group::{
    ConnectionGroup, EmitOn, FieldSet, FieldSetResult, FieldSetSlot, FieldSetState, FieldValue,
    GroupByField, TimeoutBehavior,
};
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteStore, enum_from_str, enum_str, format_datetime, is_unique_violation, json_from_str,
    json_to_string, parse_datetime, parse_uuid, query_err,
};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct GroupRow {
    id: String,
    canvas_id: String,
    name: String,
    group_by: String,
    emit_on: String,
    timeout_secs: i64,
    timeout_behavior: String,
    deleted_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl GroupRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            canvas_id: row.try_get("canvas_id")?,
            name: row.try_get("name")?,
            group_by: row.try_get("group_by")?,
            emit_on: row.try_get("emit_on")?,
            timeout_secs: row.try_get("timeout_secs")?,
            timeout_behavior: row.try_get("timeout_behavior")?,
            deleted_at: row.try_get("deleted_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_group(self) -> Result<ConnectionGroup, RepositoryError> {
        let group_by: Vec<GroupByField> = json_from_str(&self.group_by, "group_by")?;
        let emit_on: EmitOn = enum_from_str(&self.emit_on, "emit_on")?;
        let timeout_behavior: TimeoutBehavior =
            enum_from_str(&self.timeout_behavior, "timeout_behavior")?;
        Ok(ConnectionGroup {
            id: parse_uuid(&self.id)?,
            canvas_id: parse_uuid(&self.canvas_id)?,
            name: self.name,
            group_by,
            emit_on,
            timeout_secs: self.timeout_secs as u64,
            timeout_behavior,
            deleted_at: self.deleted_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct FieldSetRow {
    id: String,
    group_id: String,
    fields: String,
    hash: String,
    state: String,
    result: Option<String>,
    created_at: String,
    finalized_at: Option<String>,
}

impl FieldSetRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            fields: row.try_get("fields")?,
            hash: row.try_get("hash")?,
            state: row.try_get("state")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            finalized_at: row.try_get("finalized_at")?,
        })
    }

    fn into_field_set(self) -> Result<FieldSet, RepositoryError> {
        let fields: Vec<FieldValue> = json_from_str(&self.fields, "field set fields")?;
        let state: FieldSetState = enum_from_str(&self.state, "field set state")?;
        let result: Option<FieldSetResult> = self
            .result
            .as_deref()
            .map(|s| enum_from_str(s, "field set result"))
            .transpose()?;
        Ok(FieldSet {
            id: parse_uuid(&self.id)?,
            group_id: parse_uuid(&self.group_id)?,
            fields,
            hash: self.hash,
            state,
            result,
            created_at: parse_datetime(&self.created_at)?,
            finalized_at: self.finalized_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

fn slot_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FieldSetSlot, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_err)?;
    let field_set_id: String = row.try_get("field_set_id").map_err(query_err)?;
    let connection_id: String = row.try_get("connection_id").map_err(query_err)?;
    let event_id: String = row.try_get("event_id").map_err(query_err)?;
    let late: i64 = row.try_get("late").map_err(query_err)?;
    let received_at: String = row.try_get("received_at").map_err(query_err)?;
    Ok(FieldSetSlot {
        id: parse_uuid(&id)?,
        field_set_id: parse_uuid(&field_set_id)?,
        connection_id: parse_uuid(&connection_id)?,
        event_id: parse_uuid(&event_id)?,
        late: late != 0,
        received_at: parse_datetime(&received_at)?,
    })
}

const SELECT_FIELD_SET: &str = "SELECT id, group_id, fields, hash, state, result, created_at, finalized_at FROM connection_group_field_sets";

async fn insert_slot(
    executor: &sqlx::SqlitePool,
    slot: &FieldSetSlot,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO field_set_slots
           (id, field_set_id, connection_id, event_id, late, received_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(slot.id.to_string())
    .bind(slot.field_set_id.to_string())
    .bind(slot.connection_id.to_string())
    .bind(slot.event_id.to_string())
    .bind(slot.late as i64)
    .bind(format_datetime(&slot.received_at))
    .execute(executor)
    .await
    .map_err(query_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// GroupRepository impl
// ---------------------------------------------------------------------------

impl GroupRepository for SqliteStore {
    async fn upsert_group(&self, group: &ConnectionGroup) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO connection_groups
               (id, canvas_id, name, group_by, emit_on, timeout_secs, timeout_behavior,
                deleted_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 group_by = excluded.group_by,
                 emit_on = excluded.emit_on,
                 timeout_secs = excluded.timeout_secs,
                 timeout_behavior = excluded.timeout_behavior,
                 deleted_at = excluded.deleted_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(group.id.to_string())
        .bind(group.canvas_id.to_string())
        .bind(&group.name)
        .bind(json_to_string(&group.group_by, "group_by")?)
        .bind(enum_str(&group.emit_on)?)
        .bind(group.timeout_secs as i64)
        .bind(enum_str(&group.timeout_behavior)?)
        .bind(group.deleted_at.as_ref().map(format_datetime))
        .bind(format_datetime(&group.created_at))
        .bind(format_datetime(&group.updated_at))
        .execute(self.writer())
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_group(&self, id: &Uuid) -> Result<Option<ConnectionGroup>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, canvas_id, name, group_by, emit_on, timeout_secs, timeout_behavior, deleted_at, created_at, updated_at FROM connection_groups WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.reader())
        .await
        .map_err(query_err)?;
        match row {
            Some(row) => Ok(Some(GroupRow::from_row(&row).map_err(query_err)?.into_group()?)),
            None => Ok(None),
        }
    }

    async fn soft_delete_group(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE connection_groups SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(self.writer())
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_field_set(
        &self,
        group_id: &Uuid,
        hash: &str,
    ) -> Result<Option<FieldSet>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_FIELD_SET} WHERE group_id = ? AND hash = ?"))
            .bind(group_id.to_string())
            .bind(hash)
            .fetch_optional(self.reader())
            .await
            .map_err(query_err)?;
        match row {
            Some(row) => Ok(Some(
                FieldSetRow::from_row(&row).map_err(query_err)?.into_field_set()?,
            )),
            None => Ok(None),
        }
    }

    async fn try_create_field_set(&self, field_set: &FieldSet) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO connection_group_field_sets
               (id, group_id, fields, hash, state, result, created_at, finalized_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(field_set.id.to_string())
        .bind(field_set.group_id.to_string())
        .bind(json_to_string(&field_set.fields, "field set fields")?)
        .bind(&field_set.hash)
        .bind(enum_str(&field_set.state)?)
        .bind(field_set.result.as_ref().map(enum_str).transpose()?)
        .bind(format_datetime(&field_set.created_at))
        .bind(field_set.finalized_at.as_ref().map(format_datetime))
        .execute(self.writer())
        .await;

        match result {
            Ok(_) => Ok(true),
            // A concurrent creator won the (group, hash) race.
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn upsert_slot(&self, slot: &FieldSetSlot) -> Result<(), RepositoryError> {
        let mut tx = self.writer().begin().await.map_err(query_err)?;
        sqlx::query(
            "DELETE FROM field_set_slots WHERE field_set_id = ? AND connection_id = ? AND late = 0",
        )
        .bind(slot.field_set_id.to_string())
        .bind(slot.connection_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        sqlx::query(
            r#"INSERT INTO field_set_slots
               (id, field_set_id, connection_id, event_id, late, received_at)
               VALUES (?, ?, ?, ?, 0, ?)"#,
        )
        .bind(slot.id.to_string())
        .bind(slot.field_set_id.to_string())
        .bind(slot.connection_id.to_string())
        .bind(slot.event_id.to_string())
        .bind(format_datetime(&slot.received_at))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn record_late_slot(&self, slot: &FieldSetSlot) -> Result<(), RepositoryError> {
        let mut late = slot.clone();
        late.late = true;
        insert_slot(self.writer(), &late).await
    }

    async fn list_slots(&self, field_set_id: &Uuid) -> Result<Vec<FieldSetSlot>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, field_set_id, connection_id, event_id, late, received_at FROM field_set_slots WHERE field_set_id = ? AND late = 0 ORDER BY id",
        )
        .bind(field_set_id.to_string())
        .fetch_all(self.reader())
        .await
        .map_err(query_err)?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn finalize_field_set(
        &self,
        id: &Uuid,
        result: FieldSetResult,
        finalized_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            r#"UPDATE connection_group_field_sets
               SET state = 'processed', result = ?, finalized_at = ?
               WHERE id = ? AND state = 'pending'"#,
        )
        .bind(enum_str(&result)?)
        .bind(format_datetime(&finalized_at))
        .bind(id.to_string())
        .execute(self.writer())
        .await
        .map_err(query_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn overdue_field_sets(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FieldSet>, RepositoryError> {
        // Candidates come back with their group's timeout; the deadline
        // arithmetic happens here rather than in SQL text dates.
        let rows = sqlx::query(&format!(
            r#"{SELECT_FIELD_SET}
               WHERE state = 'pending' AND group_id IN (
                 SELECT id FROM connection_groups WHERE timeout_behavior != 'none'
               )
               ORDER BY created_at"#
        ))
        .fetch_all(self.reader())
        .await
        .map_err(query_err)?;

        let mut overdue = Vec::new();
        for row in &rows {
            let field_set = FieldSetRow::from_row(row).map_err(query_err)?.into_field_set()?;
            let Some(group) = self.get_group(&field_set.group_id).await? else {
                continue;
            };
            if now >= group.deadline(field_set.created_at) {
                overdue.push(field_set);
            }
        }
        Ok(overdue)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
