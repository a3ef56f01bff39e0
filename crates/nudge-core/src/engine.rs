//! Engine facade: one instance per signed-in identity.
//!
//! [`Engine::start`] wires the ledger actor, reconciler, subscription
//! coordinator, and alert dispatcher around injected collaborators. Nothing
//! here is process-global, so any number of engines can run side by side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::alerts::{AlertDispatcher, AlertSettings, DispatchStats, OpenHandler, ToastItem};
use crate::config::EngineConfig;
use crate::coordinator::{ResyncReport, SubscriptionCoordinator};
use crate::error::{EngineError, ErrorSlot};
use crate::ledger::{LedgerHandle, LedgerSnapshot, spawn_ledger};
use crate::model::{Conversation, ConversationId, NotificationId, NotificationRecord, OwnerId};
use crate::platform::AlertPlatform;
use crate::reconcile::{ReadReceipt, ReadReconciler};
use crate::store::DurableStore;
use crate::stream::MessageSource;

/// The three external collaborators an engine is built around.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DurableStore>,
    pub source: Arc<dyn MessageSource>,
    pub platform: Arc<dyn AlertPlatform>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Keeps an `on_change` callback registered. Dropping it unregisters.
#[derive(Debug)]
pub struct ChangeSubscription {
    task: JoinHandle<()>,
}

impl ChangeSubscription {
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Engine {
    owner: OwnerId,
    ledger: LedgerHandle,
    ledger_task: Mutex<Option<JoinHandle<()>>>,
    reconciler: ReadReconciler,
    coordinator: SubscriptionCoordinator,
    alerts: AlertDispatcher,
    errors: ErrorSlot,
    torn_down: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("owner", &self.owner)
            .field("torn_down", &self.is_torn_down())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start a session for `owner` and load its notifications from the
    /// store.
    ///
    /// A failed initial load is recorded in [`Engine::last_error`] and the
    /// engine starts empty.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not validate.
    pub async fn start(
        owner: OwnerId,
        collaborators: Collaborators,
        config: &EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let errors = ErrorSlot::new();
        let (ledger, ledger_task) = spawn_ledger(
            owner.clone(),
            config.ledger.preview_chars,
            Arc::clone(&collaborators.store),
            errors.clone(),
        );
        let alerts = AlertDispatcher::new(
            collaborators.platform,
            config.alerts.initial_settings(),
            config.alerts.toast_ttl(),
        );
        let reconciler = ReadReconciler::new(
            owner.clone(),
            ledger.clone(),
            collaborators.store,
            errors.clone(),
        );
        let coordinator = SubscriptionCoordinator::new(
            owner.clone(),
            collaborators.source,
            ledger.clone(),
            alerts.clone(),
            errors.clone(),
        );

        let engine = Self {
            owner,
            ledger,
            ledger_task: Mutex::new(Some(ledger_task)),
            reconciler,
            coordinator,
            alerts,
            errors,
            torn_down: AtomicBool::new(false),
        };

        match engine.reconciler.refresh().await {
            Ok(loaded) => info!(owner = %engine.owner, loaded, "notification session started"),
            Err(err) => debug!(owner = %engine.owner, "starting empty: {err}"),
        }
        Ok(engine)
    }

    #[must_use]
    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Visible notifications, most recent first.
    #[must_use]
    pub fn list(&self) -> Vec<NotificationRecord> {
        self.ledger.snapshot().records().to_vec()
    }

    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.ledger.snapshot().unread_count()
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<LedgerSnapshot> {
        self.ledger.snapshot()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<LedgerSnapshot>> {
        self.ledger.watch()
    }

    /// Replace the set of watched conversations.
    pub async fn resync(&self, conversations: &[Conversation]) -> ResyncReport {
        self.coordinator.resync(conversations).await
    }

    #[must_use]
    pub fn active_conversations(&self) -> Vec<ConversationId> {
        self.coordinator.active_conversations()
    }

    /// # Errors
    ///
    /// See [`ReadReconciler::mark_one`].
    pub async fn mark_one(&self, id: &NotificationId) -> Result<ReadReceipt, EngineError> {
        self.reconciler.mark_one(id).await
    }

    /// # Errors
    ///
    /// See [`ReadReconciler::mark_conversation`].
    pub async fn mark_conversation(
        &self,
        conversation: &ConversationId,
    ) -> Result<ReadReceipt, EngineError> {
        self.reconciler.mark_conversation(conversation).await
    }

    /// # Errors
    ///
    /// See [`ReadReconciler::mark_all`].
    pub async fn mark_all(&self) -> Result<ReadReceipt, EngineError> {
        self.reconciler.mark_all().await
    }

    /// Hide every notification locally. A later [`Engine::refresh`] brings
    /// back whatever the store still holds, unread ones included.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LedgerClosed`] after teardown.
    pub async fn clear_all(&self) -> Result<(), EngineError> {
        self.reconciler.clear_all().await
    }

    /// Reload the ledger from the store. Returns how many records loaded.
    ///
    /// # Errors
    ///
    /// See [`ReadReconciler::refresh`].
    pub async fn refresh(&self) -> Result<usize, EngineError> {
        self.reconciler.refresh().await
    }

    /// Call `on_change` after every change to the visible list or unread
    /// count, until the returned guard is dropped.
    pub fn subscribe<F>(&self, on_change: F) -> ChangeSubscription
    where
        F: Fn(&LedgerSnapshot) + Send + Sync + 'static,
    {
        let mut rx = self.ledger.watch();
        let mut last_revision = rx.borrow_and_update().revision();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = Arc::clone(&rx.borrow_and_update());
                if snapshot.revision() == last_revision {
                    continue;
                }
                last_revision = snapshot.revision();
                on_change(&snapshot);
            }
        });
        ChangeSubscription { task }
    }

    #[must_use]
    pub fn settings(&self) -> AlertSettings {
        self.alerts.settings()
    }

    pub fn set_settings(&self, settings: AlertSettings) {
        self.alerts.set_settings(settings);
    }

    #[must_use]
    pub fn toasts(&self) -> Vec<ToastItem> {
        self.alerts.toasts()
    }

    #[must_use]
    pub fn watch_toasts(&self) -> watch::Receiver<Vec<ToastItem>> {
        self.alerts.watch_toasts()
    }

    pub fn dismiss_toast(&self, id: &NotificationId) -> bool {
        self.alerts.dismiss(id)
    }

    /// Click a toast: it is dismissed and the open handler receives it.
    pub fn open_toast(&self, id: &NotificationId) -> bool {
        self.alerts.open(id)
    }

    /// Register the handler for toast and push clicks.
    pub fn on_open<F>(&self, handler: F)
    where
        F: Fn(&NotificationRecord) + Send + Sync + 'static,
    {
        let handler: OpenHandler = Arc::new(handler);
        self.alerts.set_open_handler(handler);
    }

    #[must_use]
    pub fn alert_stats(&self) -> DispatchStats {
        self.alerts.stats()
    }

    #[must_use]
    pub fn active_toast_timers(&self) -> usize {
        self.alerts.active_timers()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<EngineError> {
        self.errors.last()
    }

    #[must_use]
    pub fn watch_errors(&self) -> watch::Receiver<Option<EngineError>> {
        self.errors.watch()
    }

    pub fn clear_error(&self) {
        self.errors.clear();
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Cancel every subscription and toast timer and stop the ledger.
    /// Safe to call any number of times; also runs on drop.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.coordinator.teardown();
        self.alerts.teardown();
        if let Some(task) = self.ledger_task.lock().take() {
            task.abort();
        }
        info!(owner = %self.owner, "notification session torn down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}
