//! Connection-group aggregation engine.
//!
//! Correlates events from N upstream connections into keyed field sets and
//! emits one synthetic downstream event per field set on completion or
//! partial timeout. Both the arrival path's completion check and the sweep's
//! timeout check go through a single-writer, state-guarded finalize in the
//! store, so a field set is finalized exactly once and emits at most one
//! event regardless of which path wins the race.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use skein_types::connection::Connection;
use skein_types::error::RepositoryError;
use skein_types::event::{DEFAULT_CHANNEL, Event, EventOrigin};
use skein_types::group::{
    ConnectionGroup, EmitOn, FieldSet, FieldSetResult, FieldSetSlot, FieldSetState, FieldValue,
    GroupByField, TimeoutBehavior,
};
use uuid::Uuid;

use crate::filter::{EvalError, EventEvaluator};
use crate::repository::{ConnectionRepository, EventRepository, GroupRepository, Store};

/// Event type carried by completion emissions.
pub const EVENT_TYPE_COMPLETED: &str = "connection_group.completed";
/// Event type carried by partial-timeout emissions.
pub const EVENT_TYPE_TIMED_OUT: &str = "connection_group.timed_out";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur in the aggregation engine.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("connection group not found: {0}")]
    NotFound(Uuid),

    #[error("connection group {0} has no incoming connections")]
    NoConnections(Uuid),
}

// ---------------------------------------------------------------------------
// Arrival outcome
// ---------------------------------------------------------------------------

/// What happened to one event arriving at a connection group.
#[derive(Debug)]
pub enum Arrival {
    /// A field expression failed against the event; it joined no field set.
    Rejected { field: String, reason: EvalError },
    /// Attached to a pending field set that is still incomplete.
    Recorded { field_set_id: Uuid },
    /// The field set was already finalized; recorded for history only.
    Late { field_set_id: Uuid },
    /// This arrival completed the field set; the synthetic event to route.
    Emitted(Event),
}

// ---------------------------------------------------------------------------
// GroupEngine
// ---------------------------------------------------------------------------

/// The keyed join over a group's upstream connections.
///
/// Generic over `S: Store` so it works against SQLite or the in-memory
/// fixture.
pub struct GroupEngine<S> {
    store: Arc<S>,
    evaluator: EventEvaluator,
}

impl<S: Store> GroupEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            evaluator: EventEvaluator::new(),
        }
    }

    /// Fold an event arriving over `connection` into its group's field sets.
    pub async fn on_event(
        &self,
        connection: &Connection,
        event: &Event,
    ) -> Result<Arrival, GroupError> {
        let group_id = connection.target.id();
        let group = self
            .store
            .get_group(&group_id)
            .await?
            .ok_or(GroupError::NotFound(group_id))?;
        if group.is_deleted() {
            return Ok(Arrival::Rejected {
                field: String::new(),
                reason: EvalError::EvalFailed("group is deleted".to_string()),
            });
        }

        // 1. Compute the ordered field values; any failure rejects the event.
        let fields = match self.compute_fields(&group.group_by, event) {
            Ok(fields) => fields,
            Err((field, reason)) => {
                tracing::warn!(
                    group = group.name.as_str(),
                    event_id = %event.id,
                    field = field.as_str(),
                    %reason,
                    "event rejected from connection group"
                );
                return Ok(Arrival::Rejected { field, reason });
            }
        };

        // 2-3. Hash to the join key and find-or-create the field set.
        let hash = field_set_key(&fields);
        let field_set = self.find_or_create(&group, fields, &hash).await?;

        // Late arrival: record for history, never reopen or re-emit.
        if field_set.state == FieldSetState::Processed {
            self.store
                .record_late_slot(&FieldSetSlot::new(
                    field_set.id,
                    connection.id,
                    event.id,
                    true,
                ))
                .await?;
            tracing::debug!(field_set_id = %field_set.id, event_id = %event.id, "late arrival recorded");
            return Ok(Arrival::Late {
                field_set_id: field_set.id,
            });
        }

        // 4. Attach as this connection's slot (join, not concatenation).
        self.store
            .upsert_slot(&FieldSetSlot::new(
                field_set.id,
                connection.id,
                event.id,
                false,
            ))
            .await?;

        // 5. Completeness against the configured connection set.
        let expected = self.store.connections_into_group(&group.id).await?;
        if expected.is_empty() {
            return Err(GroupError::NoConnections(group.id));
        }
        let slots = self.store.list_slots(&field_set.id).await?;
        let filled = slots.len();
        let complete = match group.emit_on {
            EmitOn::All => filled == expected.len(),
            // Strictly more than half; exactly half is incomplete.
            EmitOn::Majority => filled * 2 > expected.len(),
        };
        if !complete {
            return Ok(Arrival::Recorded {
                field_set_id: field_set.id,
            });
        }

        // 6. Guarded finalize; only the winner emits.
        let won = self
            .store
            .finalize_field_set(&field_set.id, FieldSetResult::ReceivedAll, Utc::now())
            .await?;
        if !won {
            return Ok(Arrival::Recorded {
                field_set_id: field_set.id,
            });
        }

        tracing::info!(
            group = group.name.as_str(),
            field_set_id = %field_set.id,
            connections = filled,
            "field set complete"
        );
        let emission = self
            .build_emission(&group, &field_set, EVENT_TYPE_COMPLETED)
            .await?;
        Ok(Arrival::Emitted(emission))
    }

    /// Apply timeout behavior to every overdue pending field set.
    ///
    /// Returns the partial emissions to route. Running the sweep twice
    /// against an already-processed field set performs no second transition
    /// and no second emission.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<Event>, GroupError> {
        let overdue = self.store.overdue_field_sets(now).await?;
        let mut emissions = Vec::new();

        for field_set in overdue {
            let Some(group) = self.store.get_group(&field_set.group_id).await? else {
                continue;
            };
            match group.timeout_behavior {
                TimeoutBehavior::None => continue,
                TimeoutBehavior::Drop | TimeoutBehavior::EmitPartial => {
                    let won = self
                        .store
                        .finalize_field_set(&field_set.id, FieldSetResult::TimedOut, now)
                        .await?;
                    if !won {
                        continue;
                    }
                    tracing::info!(
                        group = group.name.as_str(),
                        field_set_id = %field_set.id,
                        behavior = ?group.timeout_behavior,
                        "field set timed out"
                    );
                    if group.timeout_behavior == TimeoutBehavior::EmitPartial {
                        emissions.push(
                            self.build_emission(&group, &field_set, EVENT_TYPE_TIMED_OUT)
                                .await?,
                        );
                    }
                }
            }
        }

        Ok(emissions)
    }

    /// Evaluate the ordered group-by expressions against the event.
    fn compute_fields(
        &self,
        group_by: &[GroupByField],
        event: &Event,
    ) -> Result<Vec<FieldValue>, (String, EvalError)> {
        let mut fields = Vec::with_capacity(group_by.len());
        for field in group_by {
            let value = self
                .evaluator
                .evaluate_field(&field.expression, event)
                .map_err(|e| (field.name.clone(), e))?;
            fields.push(FieldValue {
                name: field.name.clone(),
                value,
            });
        }
        Ok(fields)
    }

    /// Find the field set for a join key, creating it if unseen. Concurrent
    /// creators serialize through the (group, hash) unique constraint; the
    /// losing writer re-fetches the winner's row.
    async fn find_or_create(
        &self,
        group: &ConnectionGroup,
        fields: Vec<FieldValue>,
        hash: &str,
    ) -> Result<FieldSet, GroupError> {
        if let Some(existing) = self.store.find_field_set(&group.id, hash).await? {
            return Ok(existing);
        }
        let candidate = FieldSet::pending(group.id, fields, hash.to_string());
        if self.store.try_create_field_set(&candidate).await? {
            return Ok(candidate);
        }
        self.store
            .find_field_set(&group.id, hash)
            .await?
            .ok_or_else(|| {
                GroupError::Repository(RepositoryError::Query(
                    "field set vanished after create conflict".to_string(),
                ))
            })
    }

    /// Build the synthetic downstream event for a finalized field set.
    ///
    /// Payload shape: computed fields under `fields`, per-connection payloads
    /// namespaced by connection id under `sources`.
    async fn build_emission(
        &self,
        group: &ConnectionGroup,
        field_set: &FieldSet,
        event_type: &str,
    ) -> Result<Event, GroupError> {
        let mut fields = Map::new();
        for field in &field_set.fields {
            fields.insert(field.name.clone(), field.value.clone());
        }

        let mut sources = Map::new();
        for slot in self.store.list_slots(&field_set.id).await? {
            let payload = match self.store.get_event(&slot.event_id).await? {
                Some(event) => event.payload,
                None => Value::Null,
            };
            sources.insert(slot.connection_id.to_string(), payload);
        }

        Ok(Event::chain_root(
            group.canvas_id,
            EventOrigin::ConnectionGroup,
            group.id,
            DEFAULT_CHANNEL,
            event_type,
            json!({ "fields": fields, "sources": sources }),
        ))
    }
}

/// Stable hash of the ordered field values: SHA-256 over `name=value` lines
/// with values in canonical JSON. Field order is part of the key.
pub fn field_set_key(fields: &[FieldValue]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.name.as_bytes());
        hasher.update(b"=");
        hasher.update(field.value.to_string().as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        out
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
