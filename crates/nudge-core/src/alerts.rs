//! Alert dispatch for newly ingested notifications.
//!
//! A new record can produce a tone, a platform push, and a toast. Toasts
//! live in a bounded queue, newest first, each with its own expiry timer.
//! Every path that removes a toast (expiry, dismissal, eviction, teardown)
//! goes through the same slot bookkeeping, so a timer can only ever remove
//! the slot it was created for.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::model::{NotificationId, NotificationRecord};
use crate::platform::{AlertPlatform, ClickHandler, PushNotification};

/// Maximum number of toasts visible at once.
pub const TOAST_CAPACITY: usize = 3;

/// Default toast lifetime.
pub const DEFAULT_TOAST_TTL: Duration = Duration::from_millis(5000);

/// Receives the record behind a clicked toast or push.
pub type OpenHandler = Arc<dyn Fn(&NotificationRecord) + Send + Sync>;

/// User-facing alert switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSettings {
    #[serde(default = "default_true")]
    pub sound_enabled: bool,
    #[serde(default)]
    pub push_enabled: bool,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            sound_enabled: true,
            push_enabled: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// A visible toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToastItem {
    pub record: NotificationRecord,
    pub expires_at: Instant,
}

/// Counters for what the dispatcher has done this session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub tones: u64,
    pub pushes: u64,
    pub shown: u64,
    pub expired: u64,
    pub dismissed: u64,
    pub evicted: u64,
    /// Records that reached the dispatcher a second time.
    pub suppressed: u64,
}

struct ToastSlot {
    item: ToastItem,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl ToastSlot {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct DispatchState {
    slots: VecDeque<ToastSlot>,
    shown: HashSet<NotificationId>,
    next_generation: u64,
    stats: DispatchStats,
    closed: bool,
}

impl DispatchState {
    fn take_slot(&mut self, id: &NotificationId, generation: Option<u64>) -> Option<ToastSlot> {
        let pos = self.slots.iter().position(|slot| {
            &slot.item.record.id == id && generation.is_none_or(|g| g == slot.generation)
        })?;
        self.slots.remove(pos)
    }
}

struct Shared {
    state: Mutex<DispatchState>,
    settings: RwLock<AlertSettings>,
    open_handler: RwLock<Option<OpenHandler>>,
    platform: Arc<dyn AlertPlatform>,
    ttl: Duration,
    toasts: watch::Sender<Vec<ToastItem>>,
}

impl Shared {
    fn publish(&self, state: &DispatchState) {
        self.toasts
            .send_replace(state.slots.iter().map(|slot| slot.item.clone()).collect());
    }
}

/// Decides how a new notification is surfaced and owns the toast queue.
#[derive(Clone)]
pub struct AlertDispatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("settings", &*self.shared.settings.read())
            .field("ttl", &self.shared.ttl)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl AlertDispatcher {
    #[must_use]
    pub fn new(platform: Arc<dyn AlertPlatform>, settings: AlertSettings, ttl: Duration) -> Self {
        let (toasts, _rx) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DispatchState::default()),
                settings: RwLock::new(settings),
                open_handler: RwLock::new(None),
                platform,
                ttl,
                toasts,
            }),
        }
    }

    /// Surface a newly ingested record. Never blocks on the platform.
    pub fn notify(&self, record: &NotificationRecord) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            if !state.shown.insert(record.id.clone()) {
                state.stats.suppressed += 1;
                trace!(id = %record.id, "alert already shown this session");
                return;
            }
        }

        let settings = self.settings();
        if settings.sound_enabled {
            self.shared.platform.play_tone();
            self.shared.state.lock().stats.tones += 1;
        }
        if settings.push_enabled && self.shared.platform.has_permission() {
            self.push(record);
        }
        self.show_toast(record);
    }

    fn push(&self, record: &NotificationRecord) {
        let push = PushNotification {
            title: record.counterpart_name.clone(),
            body: record.message_preview.clone(),
            tag: PushNotification::tag_for(&record.conversation_id),
            notification_id: record.id.clone(),
            conversation_id: record.conversation_id.clone(),
        };
        let on_click: ClickHandler = {
            let weak = Arc::downgrade(&self.shared);
            let record = record.clone();
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    Self { shared }.open_record(&record);
                }
            })
        };

        self.shared.state.lock().stats.pushes += 1;
        let platform = Arc::clone(&self.shared.platform);
        tokio::spawn(async move {
            platform.show_notification(push, on_click).await;
        });
    }

    fn show_toast(&self, record: &NotificationRecord) {
        let mut state = self.shared.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        let timer = tokio::spawn(expire_after(
            Arc::downgrade(&self.shared),
            record.id.clone(),
            generation,
            self.shared.ttl,
        ));
        state.slots.push_front(ToastSlot {
            item: ToastItem {
                record: record.clone(),
                expires_at: Instant::now() + self.shared.ttl,
            },
            generation,
            timer: Some(timer),
        });
        state.stats.shown += 1;

        while state.slots.len() > TOAST_CAPACITY {
            if let Some(mut evicted) = state.slots.pop_back() {
                evicted.cancel_timer();
                state.stats.evicted += 1;
            }
        }
        self.shared.publish(&state);
    }

    /// Close a toast by hand. Its expiry timer is cancelled first.
    pub fn dismiss(&self, id: &NotificationId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(mut slot) = state.take_slot(id, None) else {
            return false;
        };
        slot.cancel_timer();
        state.stats.dismissed += 1;
        self.shared.publish(&state);
        true
    }

    /// Handle a click on a toast: dismiss it and forward to the open handler.
    pub fn open(&self, id: &NotificationId) -> bool {
        let record = self
            .shared
            .state
            .lock()
            .slots
            .iter()
            .find(|slot| &slot.item.record.id == id)
            .map(|slot| slot.item.record.clone());
        match record {
            Some(record) => {
                self.open_record(&record);
                true
            }
            None => false,
        }
    }

    fn open_record(&self, record: &NotificationRecord) {
        self.dismiss(&record.id);
        let handler = self.shared.open_handler.read().clone();
        if let Some(handler) = handler {
            handler(record);
        }
    }

    pub fn set_open_handler(&self, handler: OpenHandler) {
        *self.shared.open_handler.write() = Some(handler);
    }

    #[must_use]
    pub fn toasts(&self) -> Vec<ToastItem> {
        self.shared.toasts.borrow().clone()
    }

    #[must_use]
    pub fn watch_toasts(&self) -> watch::Receiver<Vec<ToastItem>> {
        self.shared.toasts.subscribe()
    }

    /// Toasts whose expiry timer has not completed.
    #[must_use]
    pub fn active_timers(&self) -> usize {
        self.shared
            .state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.timer.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }

    #[must_use]
    pub fn settings(&self) -> AlertSettings {
        *self.shared.settings.read()
    }

    pub fn set_settings(&self, settings: AlertSettings) {
        *self.shared.settings.write() = settings;
        debug!(?settings, "alert settings updated");
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.shared.state.lock().stats
    }

    /// Cancel every toast timer and stop surfacing alerts. Idempotent.
    pub fn teardown(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        if state.slots.is_empty() {
            return;
        }
        for slot in &mut state.slots {
            slot.cancel_timer();
        }
        state.slots.clear();
        self.shared.publish(&state);
    }
}

async fn expire_after(shared: Weak<Shared>, id: NotificationId, generation: u64, ttl: Duration) {
    tokio::time::sleep(ttl).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut state = shared.state.lock();
    if let Some(mut slot) = state.take_slot(&id, Some(generation)) {
        // This task is the timer; dropping the handle is all that is left.
        slot.timer = None;
        state.stats.expired += 1;
        shared.publish(&state);
        trace!(%id, "toast expired");
    }
}
