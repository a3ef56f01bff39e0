//! Optimistic read-state transitions confirmed against the store of record.
//!
//! Every mark operation follows the same steps: flip the affected records
//! in the ledger, confirm with the store, then settle. On rejection the
//! ledger is put back either by reverting exactly the ids that were flipped
//! or by reloading everything from the store.
//!
//! Records the store has not acknowledged yet are written through first, so
//! a confirm never races the ledger's own detached write.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{EngineError, ErrorSlot, StoreError};
use crate::ledger::{LedgerHandle, ReadScope, Settlement};
use crate::model::{ConversationId, NotificationId, NotificationRecord, OwnerId};
use crate::store::DurableStore;

/// Outcome of a successful mark operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadReceipt {
    /// Records that went from unread to read.
    pub marked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Revert,
    Reload,
}

#[derive(Clone)]
pub struct ReadReconciler {
    owner: OwnerId,
    ledger: LedgerHandle,
    store: Arc<dyn DurableStore>,
    errors: ErrorSlot,
}

impl std::fmt::Debug for ReadReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadReconciler")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl ReadReconciler {
    #[must_use]
    pub fn new(
        owner: OwnerId,
        ledger: LedgerHandle,
        store: Arc<dyn DurableStore>,
        errors: ErrorSlot,
    ) -> Self {
        Self {
            owner,
            ledger,
            store,
            errors,
        }
    }

    /// Mark one notification read. Unknown or already-read ids are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ReadStateConfirm`] if the store rejects the
    /// change; the record is unread again by then.
    pub async fn mark_one(&self, id: &NotificationId) -> Result<ReadReceipt, EngineError> {
        self.apply(ReadScope::One(id.clone()), Recovery::Revert)
            .await
    }

    /// Mark every unread notification in `conversation` read.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ReadStateConfirm`] if the store rejects the
    /// change; the ledger has been reloaded from the store by then, or
    /// reverted locally if that reload also failed.
    pub async fn mark_conversation(
        &self,
        conversation: &ConversationId,
    ) -> Result<ReadReceipt, EngineError> {
        self.apply(ReadScope::Conversation(conversation.clone()), Recovery::Reload)
            .await
    }

    /// Mark every unread notification read.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ReadStateConfirm`] if the store rejects the
    /// change; every affected record is unread again by then.
    pub async fn mark_all(&self) -> Result<ReadReceipt, EngineError> {
        self.apply(ReadScope::All, Recovery::Revert).await
    }

    async fn apply(&self, scope: ReadScope, recovery: Recovery) -> Result<ReadReceipt, EngineError> {
        let ids = self.ledger.mark_read(scope).await?;
        if ids.is_empty() {
            return Ok(ReadReceipt::default());
        }

        let unwritten = self.ledger.pending_writes(Some(ids.clone())).await?;
        match self.confirm(&unwritten.records, &ids).await {
            Ok(()) => {
                let marked = ids.len();
                self.ledger.settle(ids, Settlement::Commit).await?;
                debug!(marked, "read state confirmed");
                Ok(ReadReceipt { marked })
            }
            Err(source) => {
                let err = EngineError::ReadStateConfirm {
                    count: ids.len(),
                    source,
                };
                self.errors.report(err.clone());
                match recovery {
                    Recovery::Revert => self.ledger.settle(ids, Settlement::Revert).await?,
                    Recovery::Reload => self.reload_after_rejection(ids).await?,
                }
                Err(err)
            }
        }
    }

    async fn confirm(
        &self,
        unwritten: &[NotificationRecord],
        ids: &[NotificationId],
    ) -> Result<(), StoreError> {
        for record in unwritten {
            self.write_through(record).await?;
        }
        match ids {
            [id] => self.store.update_read_state(id, true).await,
            _ => self.store.batch_update_read_state(ids, true).await,
        }
    }

    /// Write one record the ledger still holds unpersisted.
    async fn write_through(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.store.upsert_if_absent(&self.owner, record).await?;
        // A closed ledger surfaces on the caller's next ledger call.
        let _ = self.ledger.acknowledge(record.id.clone()).await;
        Ok(())
    }

    /// Re-issue every unpersisted write, then query the store. Writes that
    /// fail again are reported and stay local.
    async fn load(&self) -> Result<(Vec<NotificationRecord>, u64), EngineError> {
        let unwritten = self.ledger.pending_writes(None).await?;
        for record in &unwritten.records {
            if let Err(source) = self.write_through(record).await {
                self.errors.report(EngineError::PersistenceWrite {
                    id: record.id.clone(),
                    source,
                });
            }
        }
        let records = self
            .store
            .query_by_owner(&self.owner)
            .await
            .map_err(|source| EngineError::FullReload { source })?;
        Ok((records, unwritten.since))
    }

    async fn reload_after_rejection(&self, ids: Vec<NotificationId>) -> Result<(), EngineError> {
        match self.load().await {
            Ok((records, since)) => {
                self.ledger.settle(ids, Settlement::Abandon).await?;
                self.ledger.replace(records, since).await
            }
            Err(err @ EngineError::FullReload { .. }) => {
                warn!("reload after rejected read-state change failed, reverting locally");
                self.ledger.settle(ids, Settlement::Revert).await?;
                self.errors.report(err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Replace the ledger with the store's current records for the owner.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::FullReload`] if the query fails; the ledger
    /// keeps its current contents.
    pub async fn refresh(&self) -> Result<usize, EngineError> {
        let (records, since) = match self.load().await {
            Ok(loaded) => loaded,
            Err(err) => {
                if matches!(err, EngineError::FullReload { .. }) {
                    self.errors.report(err.clone());
                }
                return Err(err);
            }
        };
        let loaded = records.len();
        self.ledger.replace(records, since).await?;
        debug!(loaded, "ledger refreshed from store");
        Ok(loaded)
    }

    /// Hide every notification locally. The store is not touched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LedgerClosed`] after teardown.
    pub async fn clear_all(&self) -> Result<(), EngineError> {
        self.ledger.clear().await
    }
}
