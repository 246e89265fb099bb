//! SQLite event and queue-item repository implementation.

use skein_core::repository::EventRepository;
use skein_types::error::RepositoryError;
use skein_types::event::{Event, EventOrigin, QueueItem};
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteStore, enum_from_str, enum_str, format_datetime, json_from_str, json_to_string,
    parse_datetime, parse_uuid, query_err,
};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct EventRow {
    id: String,
    canvas_id: String,
    origin: String,
    source_id: String,
    channel: String,
    event_type: String,
    payload: String,
    display_name: Option<String>,
    root_id: String,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            canvas_id: row.try_get("canvas_id")?,
            origin: row.try_get("origin")?,
            source_id: row.try_get("source_id")?,
            channel: row.try_get("channel")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            display_name: row.try_get("display_name")?,
            root_id: row.try_get("root_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_event(self) -> Result<Event, RepositoryError> {
        let origin: EventOrigin = enum_from_str(&self.origin, "event origin")?;
        Ok(Event {
            id: parse_uuid(&self.id)?,
            canvas_id: parse_uuid(&self.canvas_id)?,
            origin,
            source_id: parse_uuid(&self.source_id)?,
            channel: self.channel,
            event_type: self.event_type,
            payload: json_from_str(&self.payload, "event payload")?,
            display_name: self.display_name,
            root_id: parse_uuid(&self.root_id)?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<QueueItem, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_err)?;
    let node_id: String = row.try_get("node_id").map_err(query_err)?;
    let event_id: String = row.try_get("event_id").map_err(query_err)?;
    let created_at: String = row.try_get("created_at").map_err(query_err)?;
    Ok(QueueItem {
        id: parse_uuid(&id)?,
        node_id: parse_uuid(&node_id)?,
        event_id: parse_uuid(&event_id)?,
        created_at: parse_datetime(&created_at)?,
    })
}

// ---------------------------------------------------------------------------
// EventRepository impl
// ---------------------------------------------------------------------------

impl EventRepository for SqliteStore {
    async fn create_event(&self, event: &Event) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO events
               (id, canvas_id, origin, source_id, channel, event_type, payload,
                display_name, root_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.id.to_string())
        .bind(event.canvas_id.to_string())
        .bind(enum_str(&event.origin)?)
        .bind(event.source_id.to_string())
        .bind(&event.channel)
        .bind(&event.event_type)
        .bind(json_to_string(&event.payload, "event payload")?)
        .bind(&event.display_name)
        .bind(event.root_id.to_string())
        .bind(format_datetime(&event.created_at))
        .execute(self.writer())
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_event(&self, id: &Uuid) -> Result<Option<Event>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, canvas_id, origin, source_id, channel, event_type, payload, display_name, root_id, created_at FROM events WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.reader())
        .await
        .map_err(query_err)?;
        match row {
            Some(row) => Ok(Some(EventRow::from_row(&row).map_err(query_err)?.into_event()?)),
            None => Ok(None),
        }
    }

    async fn enqueue(&self, item: &QueueItem) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO queue_items (id, node_id, event_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(item.id.to_string())
            .bind(item.node_id.to_string())
            .bind(item.event_id.to_string())
            .bind(format_datetime(&item.created_at))
            .execute(self.writer())
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn queue_head(&self, node_id: &Uuid) -> Result<Option<QueueItem>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, node_id, event_id, created_at FROM queue_items WHERE node_id = ? ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(node_id.to_string())
        .fetch_optional(self.reader())
        .await
        .map_err(query_err)?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn delete_queue_item(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM queue_items WHERE id = ?")
            .bind(id.to_string())
            .execute(self.writer())
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn queue_depth(&self, node_id: &Uuid) -> Result<u64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM queue_items WHERE node_id = ?")
            .bind(node_id.to_string())
            .fetch_one(self.reader())
            .await
            .map_err(query_err)?;
        let depth: i64 = row.try_get("depth").map_err(query_err)?;
        Ok(depth as u64)
    }

    async fn nodes_with_backlog(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query("SELECT DISTINCT node_id FROM queue_items ORDER BY node_id")
            .fetch_all(self.reader())
            .await
            .map_err(query_err)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("node_id").map_err(query_err)?;
            ids.push(parse_uuid(&id)?);
        }
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::{seed_node, test_store};
    use serde_json::json;

    #[tokio::test]
    async fn event_roundtrip_preserves_payload() {
        let (_dir, store) = test_store().await;
        let event = Event::chain_root(
            Uuid::now_v7(),
            EventOrigin::EventSource,
            Uuid::now_v7(),
            "push",
            "git.push",
            json!({"ref": "refs/heads/main", "commits": [1, 2]}),
        );
        store.create_event(&event).await.unwrap();

        let stored = store.get_event(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.payload, event.payload);
        assert_eq!(stored.origin, EventOrigin::EventSource);
        assert_eq!(stored.root_id, event.id);
    }

    #[tokio::test]
    async fn queue_is_fifo_by_arrival() {
        let (_dir, store) = test_store().await;
        let canvas_id = Uuid::now_v7();
        let node_id = seed_node(&store, canvas_id, "deploy").await.id;

        let mut items = Vec::new();
        for i in 0..3 {
            let event = Event::chain_root(
                canvas_id,
                EventOrigin::EventSource,
                Uuid::now_v7(),
                "push",
                "git.push",
                json!({ "n": i }),
            );
            store.create_event(&event).await.unwrap();
            let item = QueueItem::new(node_id, event.id);
            store.enqueue(&item).await.unwrap();
            items.push(item);
        }

        assert_eq!(store.queue_depth(&node_id).await.unwrap(), 3);
        for expected in &items {
            let head = store.queue_head(&node_id).await.unwrap().unwrap();
            assert_eq!(head.id, expected.id);
            assert!(store.delete_queue_item(&head.id).await.unwrap());
        }
        assert_eq!(store.queue_depth(&node_id).await.unwrap(), 0);
        assert!(store.queue_head(&node_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backlog_lists_distinct_nodes() {
        let (_dir, store) = test_store().await;
        let canvas_id = Uuid::now_v7();
        let node_a = seed_node(&store, canvas_id, "build").await.id;
        let node_b = seed_node(&store, canvas_id, "deploy").await.id;

        for node_id in [node_a, node_a, node_b] {
            let event = Event::chain_root(
                canvas_id,
                EventOrigin::EventSource,
                Uuid::now_v7(),
                "push",
                "git.push",
                json!({}),
            );
            store.create_event(&event).await.unwrap();
            store.enqueue(&QueueItem::new(node_id, event.id)).await.unwrap();
        }

        let backlog = store.nodes_with_backlog().await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert!(backlog.contains(&node_a));
        assert!(backlog.contains(&node_b));
    }
}
