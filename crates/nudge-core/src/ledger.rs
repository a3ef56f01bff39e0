//! Notification ledger: ordered records plus derived unread count.
//!
//! [`LedgerState`] is the synchronous core. At runtime it is owned by a
//! single actor task ([`spawn_ledger`]); every conversation stream funnels
//! into that task through [`LedgerHandle`], so the composite-key
//! check-and-insert is serialized and two near-simultaneous deliveries of
//! the same event cannot both be treated as new.
//!
//! Readers never lock: each mutation publishes an immutable
//! [`LedgerSnapshot`] on a watch channel.
//!
//! The ledger is local-first. A new record is written to the store on a
//! detached task and stays *unpersisted* until that write is acknowledged.
//! Reloads keep unpersisted records, and read confirms write them through
//! before touching the store.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{EngineError, ErrorSlot};
use crate::model::{
    Conversation, ConversationId, MessageEvent, NotificationId, NotificationRecord, OwnerId,
    ReadState,
};
use crate::store::{DurableStore, UpsertOutcome};

/// Commands buffered ahead of the ledger actor before senders wait.
pub const LEDGER_QUEUE_DEPTH: usize = 256;

/// Which records a read transition applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadScope {
    One(NotificationId),
    Conversation(ConversationId),
    All,
}

impl ReadScope {
    fn matches(&self, record: &NotificationRecord) -> bool {
        match self {
            Self::One(id) => &record.id == id,
            Self::Conversation(conversation) => &record.conversation_id == conversation,
            Self::All => true,
        }
    }
}

/// How an in-flight optimistic read transition ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Store confirmed; the records stay read.
    Commit,
    /// Store rejected; the records go back to unread.
    Revert,
    /// Forget the pending marks without touching the records (a reload
    /// follows).
    Abandon,
}

/// Immutable view of the ledger at one revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    records: Vec<NotificationRecord>,
    pending: BTreeSet<NotificationId>,
    unread: usize,
    revision: u64,
    ingest_attempts: u64,
}

impl LedgerSnapshot {
    fn new(
        records: Vec<NotificationRecord>,
        pending: BTreeSet<NotificationId>,
        revision: u64,
        ingest_attempts: u64,
    ) -> Self {
        let unread = records.iter().filter(|record| !record.read).count();
        Self {
            records,
            pending,
            unread,
            revision,
            ingest_attempts,
        }
    }

    /// Visible records, most recent first.
    #[must_use]
    pub fn records(&self) -> &[NotificationRecord] {
        &self.records
    }

    #[must_use]
    pub const fn unread_count(&self) -> usize {
        self.unread
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &NotificationId) -> Option<&NotificationRecord> {
        self.records.iter().find(|record| &record.id == id)
    }

    /// Read state of a visible record, including in-flight marks.
    #[must_use]
    pub fn read_state(&self, id: &NotificationId) -> Option<ReadState> {
        self.get(id).map(|record| {
            if !record.read {
                ReadState::Unread
            } else if self.pending.contains(id) {
                ReadState::PendingRead
            } else {
                ReadState::Read
            }
        })
    }

    #[must_use]
    pub fn unread_in(&self, conversation: &ConversationId) -> usize {
        self.records
            .iter()
            .filter(|record| &record.conversation_id == conversation && !record.read)
            .count()
    }

    /// Bumped on every change to the visible records or their read flags.
    /// Settling a commit changes neither, so it leaves the revision alone.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Events handed to the ledger so far, duplicates included.
    #[must_use]
    pub const fn ingest_attempts(&self) -> u64 {
        self.ingest_attempts
    }
}

/// Synchronous ledger state. See the module docs for how it is shared.
#[derive(Debug, Clone)]
pub struct LedgerState {
    owner: OwnerId,
    preview_chars: usize,
    records: VecDeque<NotificationRecord>,
    /// Every key ever admitted. Survives `clear` so a re-delivered event
    /// stays a no-op after the view was dismissed.
    seen: HashSet<NotificationId>,
    pending: BTreeSet<NotificationId>,
    /// Admitted here but not yet acknowledged by the store.
    unpersisted: BTreeMap<NotificationId, NotificationRecord>,
    /// Admission sequence of every locally ingested record.
    admitted_at: HashMap<NotificationId, u64>,
    admitted: u64,
    revision: u64,
    ingest_attempts: u64,
}

/// Records the store has not acknowledged, read together with the
/// admission mark a following reload is measured against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingWrites {
    pub records: Vec<NotificationRecord>,
    pub since: u64,
}

impl LedgerState {
    #[must_use]
    pub fn new(owner: OwnerId, preview_chars: usize) -> Self {
        Self {
            owner,
            preview_chars,
            records: VecDeque::new(),
            seen: HashSet::new(),
            pending: BTreeSet::new(),
            unpersisted: BTreeMap::new(),
            admitted_at: HashMap::new(),
            admitted: 0,
            revision: 0,
            ingest_attempts: 0,
        }
    }

    #[must_use]
    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Admit an event. Returns the new record, or `None` when its composite
    /// key was already seen.
    pub fn ingest(
        &mut self,
        event: &MessageEvent,
        conversation: &Conversation,
        now: DateTime<Utc>,
    ) -> Option<NotificationRecord> {
        self.ingest_attempts += 1;

        let record = NotificationRecord::from_event(
            &self.owner,
            event,
            conversation,
            self.preview_chars,
            now,
        );
        if !self.seen.insert(record.id.clone()) {
            trace!(id = %record.id, "duplicate event ignored");
            return None;
        }

        self.admitted += 1;
        self.admitted_at.insert(record.id.clone(), self.admitted);
        self.unpersisted.insert(record.id.clone(), record.clone());
        self.records.push_front(record.clone());
        self.revision += 1;
        Some(record)
    }

    /// The store now holds `id`. Returns whether it was still unpersisted.
    pub fn acknowledge(&mut self, id: &NotificationId) -> bool {
        self.unpersisted.remove(id).is_some()
    }

    /// Unpersisted records, limited to `ids` when given.
    #[must_use]
    pub fn pending_writes(&self, ids: Option<&[NotificationId]>) -> PendingWrites {
        let records = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.unpersisted.get(id))
                .cloned()
                .collect(),
            None => self.unpersisted.values().cloned().collect(),
        };
        PendingWrites {
            records,
            since: self.admitted,
        }
    }

    #[must_use]
    pub fn unpersisted_len(&self) -> usize {
        self.unpersisted.len()
    }

    /// Admission mark for [`Self::replace`].
    #[must_use]
    pub const fn admitted(&self) -> u64 {
        self.admitted
    }

    /// Optimistically mark every unread record in `scope` as read.
    ///
    /// Returns the ids whose prior state was unread; those are the ids to
    /// confirm and, on failure, to settle.
    pub fn mark_read(&mut self, scope: &ReadScope, now: DateTime<Utc>) -> Vec<NotificationId> {
        let mut marked = Vec::new();
        for record in &mut self.records {
            if record.read || !scope.matches(record) {
                continue;
            }
            record.read = true;
            record.read_at = Some(now);
            self.pending.insert(record.id.clone());
            marked.push(record.id.clone());
        }

        if !marked.is_empty() {
            self.revision += 1;
        }
        marked
    }

    /// Finish an optimistic transition for `ids`.
    ///
    /// Only ids still pending are affected, so settling twice is harmless.
    pub fn settle(&mut self, ids: &[NotificationId], settlement: Settlement) {
        let mut changed = false;
        for id in ids {
            if !self.pending.remove(id) {
                continue;
            }
            if settlement != Settlement::Revert {
                continue;
            }
            if let Some(record) = self.records.iter_mut().find(|record| &record.id == id) {
                record.read = false;
                record.read_at = None;
                changed = true;
            }
        }

        if changed {
            self.revision += 1;
        }
    }

    /// Replace the visible records with a reload from the store.
    ///
    /// `since` is the admission mark taken before the store was queried.
    /// Local records the reload cannot contain are kept: those still
    /// unpersisted (hidden ones come back too) and those admitted after
    /// `since`. The result is ordered by timestamp, newest first.
    ///
    /// Marks still in flight are re-applied so a reload that races a
    /// confirm does not flash those records back to unread.
    pub fn replace(&mut self, records: Vec<NotificationRecord>, since: u64, now: DateTime<Utc>) {
        let loaded: HashSet<NotificationId> = records.iter().map(|record| record.id.clone()).collect();

        let mut local: Vec<NotificationRecord> = self
            .records
            .iter()
            .filter(|record| !loaded.contains(&record.id))
            .filter(|record| {
                self.unpersisted.contains_key(&record.id)
                    || self.admitted_at.get(&record.id).is_some_and(|seq| *seq > since)
            })
            .cloned()
            .collect();
        let kept: HashSet<NotificationId> = local.iter().map(|record| record.id.clone()).collect();
        local.extend(
            self.unpersisted
                .values()
                .filter(|record| !loaded.contains(&record.id) && !kept.contains(&record.id))
                .cloned(),
        );
        for record in &mut local {
            if !self.unpersisted.contains_key(&record.id) {
                continue;
            }
            // The store has never seen an unpersisted record, so only a mark
            // still in flight can make it read.
            let marked = self.pending.contains(&record.id);
            if record.read != marked {
                record.read = marked;
                record.read_at = marked.then_some(now);
            }
        }

        let mut merged: Vec<NotificationRecord> = records
            .into_iter()
            .map(|mut record| {
                if self.pending.contains(&record.id) && !record.read {
                    record.read = true;
                    record.read_at = Some(now);
                }
                record
            })
            .collect();
        merged.extend(local);
        merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        self.seen.extend(loaded);
        self.records = merged.into();
        self.revision += 1;
    }

    /// Hide every record locally. Nothing is deleted or marked read.
    pub fn clear(&mut self) {
        if self.records.is_empty() {
            return;
        }
        self.records.clear();
        self.revision += 1;
    }

    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot::new(
            self.records.iter().cloned().collect(),
            self.pending.clone(),
            self.revision,
            self.ingest_attempts,
        )
    }
}

enum Command {
    Ingest {
        event: MessageEvent,
        conversation: Conversation,
        reply: oneshot::Sender<Option<NotificationRecord>>,
    },
    MarkRead {
        scope: ReadScope,
        reply: oneshot::Sender<Vec<NotificationId>>,
    },
    Settle {
        ids: Vec<NotificationId>,
        settlement: Settlement,
        reply: oneshot::Sender<()>,
    },
    Replace {
        records: Vec<NotificationRecord>,
        since: u64,
        reply: oneshot::Sender<()>,
    },
    PendingWrites {
        ids: Option<Vec<NotificationId>>,
        reply: oneshot::Sender<PendingWrites>,
    },
    Persisted {
        id: NotificationId,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable client for the ledger actor.
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<LedgerSnapshot>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ingest { .. } => "Ingest",
            Self::MarkRead { .. } => "MarkRead",
            Self::Settle { .. } => "Settle",
            Self::Replace { .. } => "Replace",
            Self::PendingWrites { .. } => "PendingWrites",
            Self::Persisted { .. } => "Persisted",
            Self::Clear { .. } => "Clear",
        };
        f.write_str(name)
    }
}

impl LedgerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::LedgerClosed)?;
        rx.await.map_err(|_| EngineError::LedgerClosed)
    }

    /// Ingest one event; `Some` only for a first-seen composite key.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LedgerClosed`] after teardown.
    pub async fn ingest(
        &self,
        event: MessageEvent,
        conversation: Conversation,
    ) -> Result<Option<NotificationRecord>, EngineError> {
        self.request(|reply| Command::Ingest {
            event,
            conversation,
            reply,
        })
        .await
    }

    /// # Errors
    ///
    /// Returns [`EngineError::LedgerClosed`] after teardown.
    pub async fn mark_read(&self, scope: ReadScope) -> Result<Vec<NotificationId>, EngineError> {
        self.request(|reply| Command::MarkRead { scope, reply }).await
    }

    /// # Errors
    ///
    /// Returns [`EngineError::LedgerClosed`] after teardown.
    pub async fn settle(
        &self,
        ids: Vec<NotificationId>,
        settlement: Settlement,
    ) -> Result<(), EngineError> {
        self.request(|reply| Command::Settle {
            ids,
            settlement,
            reply,
        })
        .await
    }

    /// # Errors
    ///
    /// Returns [`EngineError::LedgerClosed`] after teardown.
    pub async fn replace(
        &self,
        records: Vec<NotificationRecord>,
        since: u64,
    ) -> Result<(), EngineError> {
        self.request(|reply| Command::Replace {
            records,
            since,
            reply,
        })
        .await
    }

    /// Unpersisted records among `ids`, or all of them for `None`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LedgerClosed`] after teardown.
    pub async fn pending_writes(
        &self,
        ids: Option<Vec<NotificationId>>,
    ) -> Result<PendingWrites, EngineError> {
        self.request(|reply| Command::PendingWrites { ids, reply })
            .await
    }

    /// Record that the store now holds `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LedgerClosed`] after teardown.
    pub async fn acknowledge(&self, id: NotificationId) -> Result<(), EngineError> {
        self.tx
            .send(Command::Persisted { id })
            .await
            .map_err(|_| EngineError::LedgerClosed)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::LedgerClosed`] after teardown.
    pub async fn clear(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Clear { reply }).await
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<LedgerSnapshot> {
        self.snapshots.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<LedgerSnapshot>> {
        self.snapshots.clone()
    }
}

/// Start the ledger actor for `owner`.
///
/// First-seen records are written to `store` on a detached task that
/// acknowledges the write back to the actor; a failed write is reported to
/// `errors` as a warning and the record stays unpersisted.
#[must_use]
pub fn spawn_ledger(
    owner: OwnerId,
    preview_chars: usize,
    store: Arc<dyn DurableStore>,
    errors: ErrorSlot,
) -> (LedgerHandle, JoinHandle<()>) {
    let state = LedgerState::new(owner, preview_chars);
    let (snap_tx, snap_rx) = watch::channel(Arc::new(state.snapshot()));
    let (tx, rx) = mpsc::channel(LEDGER_QUEUE_DEPTH);

    let acks = tx.downgrade();
    let task = tokio::spawn(run_ledger(state, rx, acks, snap_tx, store, errors));
    (
        LedgerHandle {
            tx,
            snapshots: snap_rx,
        },
        task,
    )
}

async fn run_ledger(
    mut state: LedgerState,
    mut rx: mpsc::Receiver<Command>,
    acks: mpsc::WeakSender<Command>,
    snapshots: watch::Sender<Arc<LedgerSnapshot>>,
    store: Arc<dyn DurableStore>,
    errors: ErrorSlot,
) {
    let publish = |state: &LedgerState| {
        snapshots.send_replace(Arc::new(state.snapshot()));
    };

    while let Some(command) = rx.recv().await {
        let now = Utc::now();
        match command {
            Command::Ingest {
                event,
                conversation,
                reply,
            } => {
                let record = state.ingest(&event, &conversation, now);
                if let Some(record) = &record {
                    persist(
                        Arc::clone(&store),
                        errors.clone(),
                        acks.clone(),
                        state.owner().clone(),
                        record.clone(),
                    );
                }
                publish(&state);
                let _ = reply.send(record);
            }
            Command::MarkRead { scope, reply } => {
                let marked = state.mark_read(&scope, now);
                publish(&state);
                let _ = reply.send(marked);
            }
            Command::Settle {
                ids,
                settlement,
                reply,
            } => {
                state.settle(&ids, settlement);
                publish(&state);
                let _ = reply.send(());
            }
            Command::Replace {
                records,
                since,
                reply,
            } => {
                state.replace(records, since, now);
                publish(&state);
                let _ = reply.send(());
            }
            Command::PendingWrites { ids, reply } => {
                let _ = reply.send(state.pending_writes(ids.as_deref()));
            }
            Command::Persisted { id } => {
                if state.acknowledge(&id) {
                    trace!(%id, "write acknowledged");
                }
            }
            Command::Clear { reply } => {
                state.clear();
                publish(&state);
                let _ = reply.send(());
            }
        }
    }

    debug!(owner = %state.owner(), "ledger actor stopped");
}

fn persist(
    store: Arc<dyn DurableStore>,
    errors: ErrorSlot,
    acks: mpsc::WeakSender<Command>,
    owner: OwnerId,
    record: NotificationRecord,
) {
    tokio::spawn(async move {
        match store.upsert_if_absent(&owner, &record).await {
            Ok(outcome) => {
                if outcome == UpsertOutcome::Existing {
                    debug!(id = %record.id, "notification already present in store");
                } else {
                    trace!(id = %record.id, "notification persisted");
                }
                if let Some(acks) = acks.upgrade() {
                    let _ = acks.send(Command::Persisted { id: record.id }).await;
                }
            }
            Err(source) => errors.report(EngineError::PersistenceWrite {
                id: record.id,
                source,
            }),
        }
    });
}
