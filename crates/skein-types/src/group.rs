//! Connection groups: keyed joins over events from multiple connections.
//!
//! A `ConnectionGroup` correlates events from N upstream connections into
//! `FieldSet`s keyed by computed field values. A field set is finalized
//! exactly once (completion or timeout) and never deleted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Group configuration
// ---------------------------------------------------------------------------

/// One computed join-key field: a name and the expression producing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupByField {
    pub name: String,
    pub expression: String,
}

/// When a field set counts as complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitOn {
    /// Every configured connection must contribute.
    All,
    /// Strictly more than half must contribute; exactly half is incomplete.
    Majority,
}

/// What happens to a field set that outlives the group timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutBehavior {
    /// Leave it pending forever.
    None,
    /// Finalize as timed out with no emission.
    Drop,
    /// Finalize as timed out and emit from whatever arrived.
    EmitPartial,
}

/// A join node correlating events from multiple connections by computed key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionGroup {
    /// UUIDv7 group ID.
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub name: String,
    /// Ordered field list; order is part of the key hash.
    pub group_by: Vec<GroupByField>,
    pub emit_on: EmitOn,
    pub timeout_secs: u64,
    pub timeout_behavior: TimeoutBehavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionGroup {
    /// Deadline for a field set created at `created_at`.
    pub fn deadline(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + Duration::seconds(self.timeout_secs as i64)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Field sets
// ---------------------------------------------------------------------------

/// Lifecycle state of a field set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSetState {
    Pending,
    Processed,
}

/// How a processed field set was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSetResult {
    ReceivedAll,
    TimedOut,
}

/// One computed field value within a field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub name: String,
    pub value: Value,
}

/// One join-key instance tracking partial/complete arrival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSet {
    /// UUIDv7 field-set ID.
    pub id: Uuid,
    pub group_id: Uuid,
    /// Ordered field values, in group-by order.
    pub fields: Vec<FieldValue>,
    /// Stable hash of the ordered values; unique per group.
    pub hash: String,
    pub state: FieldSetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<FieldSetResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl FieldSet {
    /// Build a fresh pending field set for a computed key.
    pub fn pending(group_id: Uuid, fields: Vec<FieldValue>, hash: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            group_id,
            fields,
            hash,
            state: FieldSetState::Pending,
            result: None,
            created_at: Utc::now(),
            finalized_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == FieldSetState::Pending
    }
}

/// One matched event slot within a field set.
///
/// At most one live slot per connection (a re-arrival replaces the slot).
/// Arrivals after finalization are recorded with `late = true` and never
/// reopen or re-emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSetSlot {
    pub id: Uuid,
    pub field_set_id: Uuid,
    pub connection_id: Uuid,
    pub event_id: Uuid,
    #[serde(default)]
    pub late: bool,
    pub received_at: DateTime<Utc>,
}

impl FieldSetSlot {
    pub fn new(field_set_id: Uuid, connection_id: Uuid, event_id: Uuid, late: bool) -> Self {
        Self {
            id: Uuid::now_v7(),
            field_set_id,
            connection_id,
            event_id,
            late,
            received_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
