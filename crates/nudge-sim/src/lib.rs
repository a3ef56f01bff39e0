//! nudge-sim library.
//!
//! Seeded workloads drive a real [`Engine`] over the in-memory
//! collaborators: bursts of messages across conversations, duplicate and
//! self-authored deliveries, read-state confirms that the store rejects,
//! clears, refreshes, resubscriptions, and mark-while-arriving races. Every
//! step is recorded so the oracle can check the ledger invariants
//! afterwards, and a failing seed replays exactly.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod campaign;
pub mod oracle;
pub mod rng;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use nudge_core::config::EngineConfig;
use nudge_core::memory::{MemorySource, MemoryStore, RecordingPlatform};
use nudge_core::model::ReadState;
use nudge_core::store::DurableStore;
use nudge_core::stream::MessageSource;
use nudge_core::{
    Collaborators, Conversation, ConversationId, Engine, MessageEvent, NotificationId,
    NotificationRecord, OwnerId,
};

use crate::rng::DeterministicRng;

/// Identity the simulated session belongs to.
pub const SIM_OWNER: &str = "coach";

const INGEST_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE_YIELDS: usize = 4;
const PERSIST_YIELDS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub conversations: usize,
    pub steps: u64,
    /// Chance that a delivery repeats an earlier event (percent, 0–100).
    pub duplicate_percent: u8,
    /// Chance that a delivery is authored by the owner (percent, 0–100).
    pub self_echo_percent: u8,
    /// Chance that the store rejects a read-state confirm (percent, 0–100).
    pub confirm_failure_percent: u8,
    /// Chance that a step is a read-state operation (percent, 0–100).
    pub mark_percent: u8,
    /// Chance that a step clears, refreshes, or resubscribes (percent, 0–100).
    pub churn_percent: u8,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            conversations: 4,
            steps: 60,
            duplicate_percent: 15,
            self_echo_percent: 10,
            confirm_failure_percent: 20,
            mark_percent: 30,
            churn_percent: 10,
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if the workload would be empty.
    pub fn validate(&self) -> Result<()> {
        if self.conversations == 0 {
            bail!("conversations must be > 0");
        }
        if self.steps == 0 {
            bail!("steps must be > 0");
        }
        Ok(())
    }
}

/// One workload step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Deliver {
        conversation: ConversationId,
        event_id: String,
    },
    Duplicate {
        conversation: ConversationId,
        event_id: String,
    },
    SelfEcho {
        conversation: ConversationId,
        event_id: String,
    },
    MarkOne {
        id: NotificationId,
        inject_failure: bool,
    },
    MarkConversation {
        conversation: ConversationId,
        inject_failure: bool,
    },
    MarkAll {
        inject_failure: bool,
    },
    /// `mark_conversation` with its confirm held while a new message for
    /// the same conversation arrives.
    MarkDuringArrival {
        conversation: ConversationId,
        event_id: String,
    },
    Clear,
    Refresh,
    Resubscribe {
        conversation: ConversationId,
    },
}

/// What a step did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Ingested { fresh: bool },
    Skipped,
    Marked { marked: usize, rejected: bool },
    Raced { marked: usize, arrival_unread: bool },
    Cleared,
    Refreshed { loaded: usize, store_len: usize },
    Resubscribed { started: usize, stopped: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step: u64,
    pub action: Action,
    pub outcome: Outcome,
}

/// Engine state observed after a step settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub step: u64,
    pub unread_count: usize,
    pub recounted_unread: usize,
    pub visible: usize,
    pub distinct_visible: usize,
    pub pending: usize,
    pub toasts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub observations: Vec<Observation>,
    /// Deliveries the engine should have ingested (self echoes excluded).
    pub expected_attempts: u64,
    pub ingest_attempts: u64,
    /// Distinct events ever delivered by counterparts.
    pub distinct_events: usize,
    pub store_len: usize,
    /// Visible ledger read flags at the end of the run.
    pub ledger_read: BTreeMap<NotificationId, bool>,
    /// Store read flags for the same owner.
    pub store_read: BTreeMap<NotificationId, bool>,
    pub rejected_confirms: usize,
    pub races: usize,
    /// At least one rejected confirm and one race happened.
    pub interesting_state_reached: bool,
}

pub struct Simulator {
    config: SimulationConfig,
}

enum MarkTarget<'a> {
    One(&'a NotificationId),
    Conversation(&'a ConversationId),
    All,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if `config` does not validate.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run the workload on a fresh single-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be built or the engine stops
    /// making progress.
    pub fn run(&mut self) -> Result<SimulationResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .context("Failed to build simulation runtime")?;
        let config = self.config.clone();
        runtime.block_on(async move { World::start(config).await?.run().await })
    }
}

struct World {
    config: SimulationConfig,
    rng: DeterministicRng,
    owner: OwnerId,
    conversations: Vec<Conversation>,
    store: Arc<MemoryStore>,
    source: Arc<MemorySource>,
    engine: Engine,
    /// Latest event per conversation, as the source would replay it.
    latest: BTreeMap<ConversationId, MessageEvent>,
    delivered: Vec<MessageEvent>,
    fresh_ids: HashSet<NotificationId>,
    next_event: u64,
    expected_attempts: u64,
    trace: Vec<TraceEvent>,
    observations: Vec<Observation>,
    rejected_confirms: usize,
    races: usize,
}

impl World {
    async fn start(config: SimulationConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemorySource::new());
        let mut engine_config = EngineConfig::default();
        engine_config.alerts.push_enabled = true;

        let owner = OwnerId::from(SIM_OWNER);
        let engine = Engine::start(
            owner.clone(),
            Collaborators {
                store: Arc::clone(&store) as Arc<dyn DurableStore>,
                source: Arc::clone(&source) as Arc<dyn MessageSource>,
                platform: Arc::new(RecordingPlatform::new(true)),
            },
            &engine_config,
        )
        .await?;

        let conversations: Vec<Conversation> = (0..config.conversations)
            .map(|n| Conversation::new(format!("conv-{n}"), format!("client-{n}"), format!("Client {n}")))
            .collect();
        let report = engine.resync(&conversations).await;
        if !report.failed.is_empty() {
            bail!("initial subscriptions failed: {:?}", report.failed);
        }

        Ok(Self {
            rng: DeterministicRng::new(config.seed),
            config,
            owner,
            conversations,
            store,
            source,
            engine,
            latest: BTreeMap::new(),
            delivered: Vec::new(),
            fresh_ids: HashSet::new(),
            next_event: 0,
            expected_attempts: 0,
            trace: Vec::new(),
            observations: Vec::new(),
            rejected_confirms: 0,
            races: 0,
        })
    }

    async fn run(mut self) -> Result<SimulationResult> {
        for step in 0..self.config.steps {
            let action = self.choose();
            let outcome = self
                .apply(&action)
                .await
                .with_context(|| format!("step {step} ({action:?})"))?;
            self.observe(step);
            self.trace.push(TraceEvent {
                step,
                action,
                outcome,
            });
        }
        self.finish().await
    }

    fn choose(&mut self) -> Action {
        let conversation = self.conversations[self.rng.next_index(self.conversations.len())]
            .id
            .clone();

        if self.rng.hit_rate_percent(self.config.churn_percent) {
            return match self.rng.next_bounded(3) {
                0 => Action::Clear,
                1 => Action::Refresh,
                _ => Action::Resubscribe { conversation },
            };
        }

        if self.rng.hit_rate_percent(self.config.mark_percent) {
            let inject_failure = self.rng.hit_rate_percent(self.config.confirm_failure_percent);
            let visible = self.engine.list();
            return match self.rng.next_bounded(4) {
                0 if !visible.is_empty() => Action::MarkOne {
                    id: visible[self.rng.next_index(visible.len())].id.clone(),
                    inject_failure,
                },
                1 => Action::MarkConversation {
                    conversation,
                    inject_failure,
                },
                2 => Action::MarkDuringArrival {
                    conversation,
                    event_id: self.new_event_id(),
                },
                _ => Action::MarkAll { inject_failure },
            };
        }

        if !self.delivered.is_empty() && self.rng.hit_rate_percent(self.config.duplicate_percent) {
            let earlier = &self.delivered[self.rng.next_index(self.delivered.len())];
            return Action::Duplicate {
                conversation: earlier.conversation_id.clone(),
                event_id: earlier.event_id.clone(),
            };
        }

        let event_id = self.new_event_id();
        if self.rng.hit_rate_percent(self.config.self_echo_percent) {
            Action::SelfEcho {
                conversation,
                event_id,
            }
        } else {
            Action::Deliver {
                conversation,
                event_id,
            }
        }
    }

    fn new_event_id(&mut self) -> String {
        self.next_event += 1;
        format!("evt-{}", self.next_event)
    }

    async fn apply(&mut self, action: &Action) -> Result<Outcome> {
        match action {
            Action::Deliver {
                conversation,
                event_id,
            } => {
                let event = self.counterpart_event(conversation, event_id);
                let fresh = self.deliver(event).await?;
                Ok(Outcome::Ingested { fresh })
            }
            Action::Duplicate {
                conversation,
                event_id,
            } => {
                let event = self
                    .delivered
                    .iter()
                    .find(|e| &e.conversation_id == conversation && &e.event_id == event_id)
                    .cloned()
                    .ok_or_else(|| anyhow!("duplicate of unknown event {event_id}"))?;
                let fresh = self.deliver(event).await?;
                Ok(Outcome::Ingested { fresh })
            }
            Action::SelfEcho {
                conversation,
                event_id,
            } => {
                let event = MessageEvent {
                    event_id: event_id.clone(),
                    conversation_id: conversation.clone(),
                    author_id: self.owner.clone(),
                    text: format!("reply {event_id}"),
                    timestamp: self.clock(),
                };
                self.latest.insert(conversation.clone(), event.clone());
                self.source.publish(event);
                settle().await;
                Ok(Outcome::Skipped)
            }
            Action::MarkOne { id, inject_failure } => {
                self.mark(MarkTarget::One(id), *inject_failure).await
            }
            Action::MarkConversation {
                conversation,
                inject_failure,
            } => {
                self.mark(MarkTarget::Conversation(conversation), *inject_failure)
                    .await
            }
            Action::MarkAll { inject_failure } => {
                self.mark(MarkTarget::All, *inject_failure).await
            }
            Action::MarkDuringArrival {
                conversation,
                event_id,
            } => self.mark_during_arrival(conversation, event_id).await,
            Action::Clear => {
                self.engine.clear_all().await?;
                Ok(Outcome::Cleared)
            }
            Action::Refresh => {
                let loaded = self.engine.refresh().await?;
                Ok(Outcome::Refreshed {
                    loaded,
                    store_len: self.store.len(),
                })
            }
            Action::Resubscribe { conversation } => self.resubscribe(conversation).await,
        }
    }

    fn clock(&self) -> DateTime<Utc> {
        let base = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        base + chrono::Duration::seconds(i64::try_from(self.next_event).unwrap_or(i64::MAX))
    }

    fn counterpart_event(&self, conversation: &ConversationId, event_id: &str) -> MessageEvent {
        let counterpart = self
            .conversations
            .iter()
            .find(|c| &c.id == conversation)
            .map_or_else(|| OwnerId::from("unknown"), |c| c.counterpart_id.clone());
        MessageEvent {
            event_id: event_id.to_string(),
            conversation_id: conversation.clone(),
            author_id: counterpart,
            text: format!("message {event_id}"),
            timestamp: self.clock(),
        }
    }

    /// Publish a counterpart event and wait for the ledger to process it.
    /// Returns whether it was new.
    async fn deliver(&mut self, event: MessageEvent) -> Result<bool> {
        let id = NotificationId::derive(&self.owner, &event.conversation_id, &event.event_id);
        let fresh = self.fresh_ids.insert(id);
        if fresh {
            self.delivered.push(event.clone());
        }
        self.latest
            .insert(event.conversation_id.clone(), event.clone());
        self.source.publish(event);
        self.expected_attempts += 1;
        self.wait_ingested().await?;
        Ok(fresh)
    }

    async fn wait_ingested(&self) -> Result<()> {
        let expected = self.expected_attempts;
        let mut rx = self.engine.watch();
        tokio::time::timeout(
            INGEST_TIMEOUT,
            rx.wait_for(|snap| snap.ingest_attempts() >= expected),
        )
        .await
        .context("ledger did not ingest in time")?
        .map(|_| ())
        .map_err(|_| anyhow!("ledger closed"))?;
        settle().await;
        Ok(())
    }

    /// Wait until every fresh record has reached the store, so the final
    /// store comparison sees the whole run.
    async fn wait_persisted(&self) -> Result<()> {
        for _ in 0..PERSIST_YIELDS {
            if self.store.len() >= self.fresh_ids.len() {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        bail!(
            "store holds {} of {} records",
            self.store.len(),
            self.fresh_ids.len()
        )
    }

    async fn mark(&mut self, target: MarkTarget<'_>, inject_failure: bool) -> Result<Outcome> {
        if inject_failure {
            self.store.fail_next_read_updates(1);
        }
        let result = match target {
            MarkTarget::One(id) => self.engine.mark_one(id).await,
            MarkTarget::Conversation(conversation) => {
                self.engine.mark_conversation(conversation).await
            }
            MarkTarget::All => self.engine.mark_all().await,
        };
        // An injected failure that no confirm consumed must not leak into
        // the next step.
        self.store.fail_next_read_updates(0);

        match result {
            Ok(receipt) => Ok(Outcome::Marked {
                marked: receipt.marked,
                rejected: false,
            }),
            Err(err) if inject_failure => {
                debug!("injected rejection: {err}");
                self.rejected_confirms += 1;
                Ok(Outcome::Marked {
                    marked: 0,
                    rejected: true,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn mark_during_arrival(
        &mut self,
        conversation: &ConversationId,
        event_id: &str,
    ) -> Result<Outcome> {
        let event = self.counterpart_event(conversation, event_id);
        let arrival = NotificationId::derive(&self.owner, conversation, event_id);
        self.fresh_ids.insert(arrival.clone());
        self.delivered.push(event.clone());
        self.latest.insert(conversation.clone(), event.clone());
        self.expected_attempts += 1;

        self.store.hold_read_updates(true);
        let marking = self.engine.mark_conversation(conversation);
        let arriving = async {
            settle().await;
            self.source.publish(event);
            let waited = self.wait_ingested().await;
            self.store.hold_read_updates(false);
            waited
        };
        let (marked, arrived) = tokio::join!(marking, arriving);
        arrived?;
        let marked = marked?.marked;

        self.races += 1;
        let arrival_unread =
            self.engine.snapshot().read_state(&arrival) == Some(ReadState::Unread);
        Ok(Outcome::Raced {
            marked,
            arrival_unread,
        })
    }

    async fn resubscribe(&mut self, conversation: &ConversationId) -> Result<Outcome> {
        let remaining: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| &c.id != conversation)
            .cloned()
            .collect();
        let dropped = self.engine.resync(&remaining).await;
        settle().await;
        let restored = self.engine.resync(&self.conversations).await;

        // A fresh subscription replays the conversation's latest event.
        if let Some(latest) = self.latest.get(conversation) {
            if latest.author_id != self.owner {
                self.expected_attempts += 1;
                self.wait_ingested().await?;
            } else {
                settle().await;
            }
        }
        Ok(Outcome::Resubscribed {
            started: restored.started.len(),
            stopped: dropped.stopped.len(),
        })
    }

    fn observe(&mut self, step: u64) {
        let snap = self.engine.snapshot();
        let distinct: HashSet<&NotificationId> = snap.records().iter().map(|r| &r.id).collect();
        let pending = snap
            .records()
            .iter()
            .filter(|r| snap.read_state(&r.id) == Some(ReadState::PendingRead))
            .count();
        self.observations.push(Observation {
            step,
            unread_count: snap.unread_count(),
            recounted_unread: snap.records().iter().filter(|r| !r.read).count(),
            visible: snap.len(),
            distinct_visible: distinct.len(),
            pending,
            toasts: self.engine.toasts().len(),
        });
    }

    async fn finish(self) -> Result<SimulationResult> {
        self.wait_persisted().await?;
        settle().await;

        let snap = self.engine.snapshot();
        let ledger_read = read_flags(snap.records());
        let store_records = self
            .store
            .query_by_owner(&self.owner)
            .await
            .map_err(|err| anyhow!("final store query failed: {err}"))?;
        let store_read = read_flags(&store_records);
        self.engine.teardown();

        Ok(SimulationResult {
            seed: self.config.seed,
            expected_attempts: self.expected_attempts,
            ingest_attempts: snap.ingest_attempts(),
            distinct_events: self.fresh_ids.len(),
            store_len: store_records.len(),
            ledger_read,
            store_read,
            interesting_state_reached: self.rejected_confirms > 0 && self.races > 0,
            rejected_confirms: self.rejected_confirms,
            races: self.races,
            trace: self.trace,
            observations: self.observations,
        })
    }
}

fn read_flags(records: &[NotificationRecord]) -> BTreeMap<NotificationId, bool> {
    records.iter().map(|r| (r.id.clone(), r.read)).collect()
}

async fn settle() {
    for _ in 0..SETTLE_YIELDS {
        tokio::task::yield_now().await;
    }
}
