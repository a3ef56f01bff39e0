//! Store of record for notifications and their read state.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{NotificationId, NotificationRecord, OwnerId};

/// Result of [`DurableStore::upsert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// A record with the same composite key already existed; it was left
    /// untouched.
    Existing,
}

/// Persistence collaborator. The engine treats it as the source of truth
/// for reloads and read-state confirmation, and never deletes through it.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert `record` under its composite key (`record.id`) unless that
    /// key is already present.
    async fn upsert_if_absent(
        &self,
        owner: &OwnerId,
        record: &NotificationRecord,
    ) -> Result<UpsertOutcome, StoreError>;

    /// All records for `owner`, most recent first.
    async fn query_by_owner(&self, owner: &OwnerId) -> Result<Vec<NotificationRecord>, StoreError>;

    async fn update_read_state(&self, id: &NotificationId, read: bool) -> Result<(), StoreError>;

    /// Apply `read` to every id, all or nothing.
    async fn batch_update_read_state(
        &self,
        ids: &[NotificationId],
        read: bool,
    ) -> Result<(), StoreError>;
}
