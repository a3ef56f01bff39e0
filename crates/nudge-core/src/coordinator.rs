//! Keeps exactly one live stream per conversation in the current set.
//!
//! Each live subscription owns a pump task that forwards events from the
//! source into the ledger and hands first-seen records to the alert
//! dispatcher. Aborting the pump drops the receiver, which cancels the
//! subscription at the source.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::alerts::AlertDispatcher;
use crate::error::{EngineError, ErrorSlot};
use crate::ledger::LedgerHandle;
use crate::model::{Conversation, ConversationId, OwnerId};
use crate::stream::{EventReceiver, MessageSource};

/// What a [`SubscriptionCoordinator::resync`] call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub started: Vec<ConversationId>,
    pub stopped: Vec<ConversationId>,
    /// Conversations whose subscription could not be opened. They stay
    /// inactive until a later resync retries them.
    pub failed: Vec<ConversationId>,
}

impl ResyncReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.failed.is_empty()
    }
}

struct ConversationSubscription {
    pump: JoinHandle<()>,
}

impl Drop for ConversationSubscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[derive(Default)]
struct CoordinatorState {
    active: HashMap<ConversationId, ConversationSubscription>,
    desired: HashSet<ConversationId>,
    closed: bool,
}

pub struct SubscriptionCoordinator {
    owner: OwnerId,
    source: Arc<dyn MessageSource>,
    ledger: LedgerHandle,
    alerts: AlertDispatcher,
    errors: ErrorSlot,
    state: Mutex<CoordinatorState>,
}

impl std::fmt::Debug for SubscriptionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCoordinator")
            .field("owner", &self.owner)
            .field("active", &self.active_conversations())
            .finish_non_exhaustive()
    }
}

impl SubscriptionCoordinator {
    #[must_use]
    pub fn new(
        owner: OwnerId,
        source: Arc<dyn MessageSource>,
        ledger: LedgerHandle,
        alerts: AlertDispatcher,
        errors: ErrorSlot,
    ) -> Self {
        Self {
            owner,
            source,
            ledger,
            alerts,
            errors,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Bring live subscriptions in line with `conversations`.
    ///
    /// Conversations no longer listed are stopped, new ones are started,
    /// and ones already live are left alone. Running it twice with the same
    /// list changes nothing the second time.
    pub async fn resync(&self, conversations: &[Conversation]) -> ResyncReport {
        let mut report = ResyncReport::default();
        let to_start: Vec<Conversation> = {
            let mut state = self.state.lock();
            if state.closed {
                return report;
            }
            state.desired = conversations.iter().map(|c| c.id.clone()).collect();

            let stale: Vec<ConversationId> = state
                .active
                .keys()
                .filter(|id| !state.desired.contains(*id))
                .cloned()
                .collect();
            for id in stale {
                state.active.remove(&id);
                report.stopped.push(id);
            }

            let mut queued = HashSet::new();
            conversations
                .iter()
                .filter(|c| !state.active.contains_key(&c.id) && queued.insert(c.id.clone()))
                .cloned()
                .collect()
        };

        for conversation in to_start {
            match self.source.subscribe(&conversation.id).await {
                Ok(rx) => {
                    if self.activate(&conversation, rx) {
                        report.started.push(conversation.id);
                    }
                }
                Err(source) => {
                    self.errors.report(EngineError::SubscriptionStart {
                        conversation: conversation.id.clone(),
                        source,
                    });
                    report.failed.push(conversation.id);
                }
            }
        }

        report.started.sort();
        report.stopped.sort();
        report.failed.sort();
        if !report.is_noop() {
            info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                "conversation subscriptions resynced"
            );
        }
        report
    }

    /// Install a freshly opened stream unless a concurrent resync already
    /// did, or the conversation was dropped while subscribing.
    fn activate(&self, conversation: &Conversation, rx: EventReceiver) -> bool {
        let mut state = self.state.lock();
        if state.closed
            || !state.desired.contains(&conversation.id)
            || state.active.contains_key(&conversation.id)
        {
            trace!(conversation = %conversation.id, "discarding redundant subscription");
            return false;
        }

        let pump = tokio::spawn(pump_events(
            self.owner.clone(),
            conversation.clone(),
            rx,
            self.ledger.clone(),
            self.alerts.clone(),
        ));
        state
            .active
            .insert(conversation.id.clone(), ConversationSubscription { pump });
        true
    }

    /// Live conversations, sorted.
    #[must_use]
    pub fn active_conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = self.state.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel every subscription. Later resyncs are ignored. Idempotent.
    pub fn teardown(&self) {
        let drained: Vec<ConversationSubscription> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.desired.clear();
            state.active.drain().map(|(_, sub)| sub).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "conversation subscriptions cancelled");
        }
    }
}

async fn pump_events(
    owner: OwnerId,
    conversation: Conversation,
    mut rx: EventReceiver,
    ledger: LedgerHandle,
    alerts: AlertDispatcher,
) {
    while let Some(event) = rx.recv().await {
        if event.author_id == owner {
            trace!(conversation = %conversation.id, "own message skipped");
            continue;
        }
        match ledger.ingest(event, conversation.clone()).await {
            Ok(Some(record)) => alerts.notify(&record),
            Ok(None) => {}
            Err(_) => break,
        }
    }
    debug!(conversation = %conversation.id, "conversation stream ended");
}
