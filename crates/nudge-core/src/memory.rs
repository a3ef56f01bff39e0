//! In-memory collaborators for tests, simulation, and local demos.
//!
//! Each one carries failure injection so rollback and retry paths can be
//! driven deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::{SourceError, StoreError};
use crate::model::{ConversationId, MessageEvent, NotificationId, NotificationRecord, OwnerId};
use crate::platform::{AlertPlatform, ClickHandler, PushNotification};
use crate::store::{DurableStore, UpsertOutcome};
use crate::stream::{EventReceiver, MessageSource};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreInner {
    records: HashMap<NotificationId, (OwnerId, NotificationRecord)>,
    fail_read_updates_remaining: usize,
    read_updates_failing: bool,
    upserts_failing: bool,
    queries_failing: bool,
    read_update_calls: usize,
}

impl StoreInner {
    fn take_read_failure(&mut self) -> bool {
        self.read_update_calls += 1;
        if self.read_updates_failing {
            return true;
        }
        if self.fail_read_updates_remaining > 0 {
            self.fail_read_updates_remaining -= 1;
            return true;
        }
        false
    }
}

/// Store of record kept in a hash map.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    hold: watch::Sender<bool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (hold, _rx) = watch::channel(false);
        Self {
            inner: Mutex::new(StoreInner::default()),
            hold,
        }
    }

    /// Seed a record directly, bypassing the engine.
    pub fn insert(&self, owner: &OwnerId, record: NotificationRecord) {
        self.inner
            .lock()
            .records
            .insert(record.id.clone(), (owner.clone(), record));
    }

    #[must_use]
    pub fn get(&self, id: &NotificationId) -> Option<NotificationRecord> {
        self.inner
            .lock()
            .records
            .get(id)
            .map(|(_, record)| record.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail the next `count` read-state updates (single or batch).
    pub fn fail_next_read_updates(&self, count: usize) {
        self.inner.lock().fail_read_updates_remaining = count;
    }

    pub fn set_read_updates_failing(&self, failing: bool) {
        self.inner.lock().read_updates_failing = failing;
    }

    pub fn set_upserts_failing(&self, failing: bool) {
        self.inner.lock().upserts_failing = failing;
    }

    pub fn set_queries_failing(&self, failing: bool) {
        self.inner.lock().queries_failing = failing;
    }

    /// While held, read-state updates park before applying. Releasing lets
    /// them continue, so a confirm can be kept in flight on purpose.
    pub fn hold_read_updates(&self, held: bool) {
        self.hold.send_replace(held);
    }

    #[must_use]
    pub fn read_update_calls(&self) -> usize {
        self.inner.lock().read_update_calls
    }

    async fn wait_until_released(&self) {
        let mut rx = self.hold.subscribe();
        let _ = rx.wait_for(|held| !*held).await;
    }

    fn sorted_for(&self, owner: &OwnerId) -> Vec<NotificationRecord> {
        let mut records: Vec<NotificationRecord> = self
            .inner
            .lock()
            .records
            .values()
            .filter(|(record_owner, _)| record_owner == owner)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }
}

fn apply_read(record: &mut NotificationRecord, read: bool) {
    record.read = read;
    record.read_at = if read { Some(chrono::Utc::now()) } else { None };
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn upsert_if_absent(
        &self,
        owner: &OwnerId,
        record: &NotificationRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.lock();
        if inner.upserts_failing {
            return Err(StoreError::Unavailable("upserts disabled".into()));
        }
        if inner.records.contains_key(&record.id) {
            return Ok(UpsertOutcome::Existing);
        }
        inner
            .records
            .insert(record.id.clone(), (owner.clone(), record.clone()));
        Ok(UpsertOutcome::Inserted)
    }

    async fn query_by_owner(&self, owner: &OwnerId) -> Result<Vec<NotificationRecord>, StoreError> {
        if self.inner.lock().queries_failing {
            return Err(StoreError::Unavailable("queries disabled".into()));
        }
        Ok(self.sorted_for(owner))
    }

    async fn update_read_state(&self, id: &NotificationId, read: bool) -> Result<(), StoreError> {
        self.wait_until_released().await;

        let mut inner = self.inner.lock();
        if inner.take_read_failure() {
            return Err(StoreError::Rejected("read-state update refused".into()));
        }
        let Some((_, record)) = inner.records.get_mut(id) else {
            return Err(StoreError::Rejected(format!("unknown notification {id}")));
        };
        apply_read(record, read);
        Ok(())
    }

    async fn batch_update_read_state(
        &self,
        ids: &[NotificationId],
        read: bool,
    ) -> Result<(), StoreError> {
        self.wait_until_released().await;

        let mut inner = self.inner.lock();
        if inner.take_read_failure() {
            return Err(StoreError::Rejected("batch read-state update refused".into()));
        }
        if let Some(missing) = ids.iter().find(|id| !inner.records.contains_key(*id)) {
            return Err(StoreError::Rejected(format!("unknown notification {missing}")));
        }
        for id in ids {
            if let Some((_, record)) = inner.records.get_mut(id) {
                apply_read(record, read);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SourceInner {
    latest: HashMap<ConversationId, MessageEvent>,
    subscribers: HashMap<ConversationId, Vec<mpsc::UnboundedSender<MessageEvent>>>,
    refused: HashSet<ConversationId>,
    subscribe_calls: usize,
}

/// Message transport that keeps the latest event per conversation.
#[derive(Debug, Default)]
pub struct MemorySource {
    inner: Mutex<SourceInner>,
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event` as its conversation's latest and fan it out to live
    /// subscribers. Returns how many subscribers received it.
    pub fn publish(&self, event: MessageEvent) -> usize {
        let mut inner = self.inner.lock();
        let conversation = event.conversation_id.clone();
        let mut delivered = 0;
        if let Some(senders) = inner.subscribers.get_mut(&conversation) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            delivered = senders.len();
        }
        inner.latest.insert(conversation, event);
        delivered
    }

    /// Make subscriptions to `conversation` fail (or succeed again).
    pub fn refuse(&self, conversation: &ConversationId, refused: bool) {
        let mut inner = self.inner.lock();
        if refused {
            inner.refused.insert(conversation.clone());
        } else {
            inner.refused.remove(conversation);
        }
    }

    /// Live subscriptions for `conversation` (closed receivers excluded).
    #[must_use]
    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(conversation)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.inner.lock().subscribe_calls
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn subscribe(&self, conversation: &ConversationId) -> Result<EventReceiver, SourceError> {
        let mut inner = self.inner.lock();
        inner.subscribe_calls += 1;
        if inner.refused.contains(conversation) {
            return Err(SourceError::Refused {
                conversation: conversation.clone(),
                reason: "subscription refused by source".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(latest) = inner.latest.get(conversation) {
            let _ = tx.send(latest.clone());
        }
        inner
            .subscribers
            .entry(conversation.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// RecordingPlatform
// ---------------------------------------------------------------------------

/// Alert platform that records what it was asked to do.
///
/// Pushes with the same tag replace each other, as browsers and mobile
/// notification centers do.
pub struct RecordingPlatform {
    permission: AtomicBool,
    tones: AtomicUsize,
    push_requests: AtomicUsize,
    visible: Mutex<Vec<(PushNotification, ClickHandler)>>,
}

impl std::fmt::Debug for RecordingPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingPlatform")
            .field("permission", &self.permission.load(Ordering::Relaxed))
            .field("tones", &self.tones.load(Ordering::Relaxed))
            .field("push_requests", &self.push_requests.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RecordingPlatform {
    #[must_use]
    pub fn new(permission: bool) -> Self {
        Self {
            permission: AtomicBool::new(permission),
            tones: AtomicUsize::new(0),
            push_requests: AtomicUsize::new(0),
            visible: Mutex::new(Vec::new()),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::Relaxed);
    }

    #[must_use]
    pub fn tones(&self) -> usize {
        self.tones.load(Ordering::Relaxed)
    }

    /// Total push requests received, coalesced or not.
    #[must_use]
    pub fn push_requests(&self) -> usize {
        self.push_requests.load(Ordering::Relaxed)
    }

    /// Pushes currently visible, one per tag.
    #[must_use]
    pub fn visible_pushes(&self) -> Vec<PushNotification> {
        self.visible
            .lock()
            .iter()
            .map(|(push, _)| push.clone())
            .collect()
    }

    /// Simulate a click on the visible push with `tag`. The push is removed.
    pub fn click(&self, tag: &str) -> bool {
        let handler = {
            let mut visible = self.visible.lock();
            let Some(pos) = visible.iter().position(|(push, _)| push.tag == tag) else {
                return false;
            };
            visible.remove(pos).1
        };
        handler();
        true
    }
}

#[async_trait]
impl AlertPlatform for RecordingPlatform {
    fn has_permission(&self) -> bool {
        self.permission.load(Ordering::Relaxed)
    }

    fn play_tone(&self) {
        self.tones.fetch_add(1, Ordering::Relaxed);
    }

    async fn show_notification(&self, push: PushNotification, on_click: ClickHandler) {
        self.push_requests.fetch_add(1, Ordering::Relaxed);
        let mut visible = self.visible.lock();
        visible.retain(|(existing, _)| existing.tag != push.tag);
        visible.push((push, on_click));
    }
}
