//! Connection-group repository trait definition.

use chrono::{DateTime, Utc};
use skein_types::error::RepositoryError;
use skein_types::group::{ConnectionGroup, FieldSet, FieldSetResult, FieldSetSlot};
use uuid::Uuid;

/// Repository trait for connection groups, field sets, and slots.
pub trait GroupRepository: Send + Sync {
    fn upsert_group(
        &self,
        group: &ConnectionGroup,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_group(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ConnectionGroup>, RepositoryError>> + Send;

    /// Tombstone a group. Returns `true` if it existed and was live.
    fn soft_delete_group(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Find the field set for a join key, regardless of its state.
    fn find_field_set(
        &self,
        group_id: &Uuid,
        hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<FieldSet>, RepositoryError>> + Send;

    /// Insert a new PENDING field set, serialized through the unique
    /// (group_id, hash) constraint. Returns `false` if a concurrent creator
    /// won; the caller re-fetches the winner's row.
    fn try_create_field_set(
        &self,
        field_set: &FieldSet,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Replace-or-insert the live slot for (field_set, connection).
    /// A second arrival from the same connection replaces the slot.
    fn upsert_slot(
        &self,
        slot: &FieldSetSlot,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Append a late arrival (after finalization) for history only.
    fn record_late_slot(
        &self,
        slot: &FieldSetSlot,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Live (non-late) slots for a field set.
    fn list_slots(
        &self,
        field_set_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<FieldSetSlot>, RepositoryError>> + Send;

    /// Guarded finalize: PENDING -> PROCESSED with the given result.
    /// Exactly one caller wins, whichever path (arrival or sweep) gets there
    /// first. Returns `true` on transition.
    fn finalize_field_set(
        &self,
        id: &Uuid,
        result: FieldSetResult,
        finalized_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// PENDING field sets whose deadline (created_at + group timeout) has
    /// passed, excluding groups with TimeoutBehavior::None.
    fn overdue_field_sets(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<FieldSet>, RepositoryError>> + Send;
}
