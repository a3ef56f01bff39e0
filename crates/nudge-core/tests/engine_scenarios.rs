//! End-to-end engine behaviour over the in-memory and SQLite collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use nudge_core::alerts::{AlertSettings, TOAST_CAPACITY};
use nudge_core::config::EngineConfig;
use nudge_core::memory::{MemorySource, MemoryStore, RecordingPlatform};
use nudge_core::model::ReadState;
use nudge_core::sqlite::SqliteStore;
use nudge_core::store::DurableStore;
use nudge_core::stream::MessageSource;
use nudge_core::{
    Collaborators, Conversation, ConversationId, Engine, EngineError, MessageEvent, NotificationId,
    OwnerId,
};

const OWNER: &str = "coach-1";

struct Harness {
    store: Arc<MemoryStore>,
    source: Arc<MemorySource>,
    platform: Arc<RecordingPlatform>,
    engine: Engine,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(EngineConfig::default(), false).await
    }

    async fn start_with(config: EngineConfig, permission: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemorySource::new());
        let platform = Arc::new(RecordingPlatform::new(permission));
        let engine = Engine::start(
            OwnerId::from(OWNER),
            Collaborators {
                store: Arc::clone(&store) as Arc<dyn DurableStore>,
                source: Arc::clone(&source) as Arc<dyn MessageSource>,
                platform: Arc::clone(&platform) as _,
            },
            &config,
        )
        .await
        .expect("engine starts");
        Self {
            store,
            source,
            platform,
            engine,
        }
    }

    async fn watch(&self, ids: &[&str]) {
        let conversations: Vec<Conversation> = ids
            .iter()
            .map(|id| Conversation::new(*id, format!("client-{id}"), format!("Client {id}")))
            .collect();
        let report = self.engine.resync(&conversations).await;
        assert!(report.failed.is_empty(), "{report:?}");
    }

    /// Publish and wait until the ledger has processed `expected_attempts`
    /// deliveries in total.
    async fn deliver(&self, event: MessageEvent, expected_attempts: u64) {
        self.source.publish(event);
        let mut rx = self.engine.watch();
        rx.wait_for(|snap| snap.ingest_attempts() >= expected_attempts)
            .await
            .expect("ledger running");
        // Let the pump hand the record to the dispatcher.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn id(&self, conversation: &str, event_id: &str) -> NotificationId {
        NotificationId::derive(
            &OwnerId::from(OWNER),
            &ConversationId::from(conversation),
            event_id,
        )
    }
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 7, minute, 0)
        .single()
        .expect("valid timestamp")
}

fn msg(conversation: &str, event_id: &str, minute: u32) -> MessageEvent {
    MessageEvent {
        event_id: event_id.into(),
        conversation_id: ConversationId::from(conversation),
        author_id: OwnerId::from(format!("client-{conversation}")),
        text: format!("{event_id} in {conversation}"),
        timestamp: at(minute),
    }
}

#[tokio::test]
async fn duplicate_delivery_keeps_two_records() {
    let h = Harness::start().await;
    h.watch(&["x", "y"]).await;

    h.deliver(msg("x", "m1", 1), 1).await;
    h.deliver(msg("y", "m2", 2), 2).await;
    h.deliver(msg("x", "m1", 1), 3).await;

    assert_eq!(h.engine.list().len(), 2);
    assert_eq!(h.engine.unread_count(), 2);
    assert_eq!(h.engine.list()[0].id, h.id("y", "m2"));
}

#[tokio::test]
async fn arrival_during_conversation_confirm_stays_unread() {
    let h = Harness::start().await;
    h.watch(&["x"]).await;
    h.deliver(msg("x", "m1", 1), 1).await;
    h.deliver(msg("x", "m2", 2), 2).await;

    h.store.hold_read_updates(true);
    let engine = &h.engine;
    let conversation = ConversationId::from("x");
    let marking = engine.mark_conversation(&conversation);
    let arriving = async {
        let mut rx = engine.watch();
        rx.wait_for(|snap| snap.read_state(&h.id("x", "m1")) == Some(ReadState::PendingRead))
            .await
            .expect("ledger running");
        h.deliver(msg("x", "m3", 3), 3).await;
        h.store.hold_read_updates(false);
    };
    let (receipt, ()) = tokio::join!(marking, arriving);

    assert_eq!(receipt.expect("confirmed").marked, 2);
    let snap = h.engine.snapshot();
    assert_eq!(snap.read_state(&h.id("x", "m3")), Some(ReadState::Unread));
    assert_eq!(snap.read_state(&h.id("x", "m1")), Some(ReadState::Read));
    assert_eq!(snap.read_state(&h.id("x", "m2")), Some(ReadState::Read));
    assert_eq!(h.engine.unread_count(), 1);
}

#[tokio::test]
async fn rejected_mark_one_restores_flag_and_count() {
    let h = Harness::start().await;
    h.watch(&["x"]).await;
    h.deliver(msg("x", "m1", 1), 1).await;
    let before = h.engine.unread_count();

    h.store.fail_next_read_updates(1);
    let err = h
        .engine
        .mark_one(&h.id("x", "m1"))
        .await
        .expect_err("store rejects");

    assert!(matches!(err, EngineError::ReadStateConfirm { .. }));
    assert_eq!(h.engine.unread_count(), before);
    assert!(!h.engine.list()[0].read);
    assert_eq!(h.engine.last_error(), Some(err));
}

#[tokio::test]
async fn unread_reappear_after_clear_and_refresh() {
    let h = Harness::start().await;
    h.watch(&["x", "y"]).await;
    h.deliver(msg("x", "m1", 1), 1).await;
    h.deliver(msg("y", "m2", 2), 2).await;
    h.engine
        .mark_one(&h.id("x", "m1"))
        .await
        .expect("confirmed");

    h.engine.clear_all().await.expect("cleared");
    assert!(h.engine.list().is_empty());
    assert_eq!(h.engine.unread_count(), 0);

    h.deliver(msg("y", "m2", 2), 3).await;
    assert!(h.engine.list().is_empty(), "cleared events stay dismissed");

    assert_eq!(h.engine.refresh().await.expect("reloaded"), 2);
    assert_eq!(h.engine.unread_count(), 1);
    let snap = h.engine.snapshot();
    assert_eq!(snap.read_state(&h.id("y", "m2")), Some(ReadState::Unread));
    assert_eq!(snap.read_state(&h.id("x", "m1")), Some(ReadState::Read));
}

#[tokio::test]
async fn mark_all_then_new_arrival() {
    let h = Harness::start().await;
    h.watch(&["x", "y"]).await;
    h.deliver(msg("x", "m1", 1), 1).await;
    h.deliver(msg("y", "m2", 2), 2).await;

    assert_eq!(h.engine.mark_all().await.expect("confirmed").marked, 2);
    assert_eq!(h.engine.unread_count(), 0);

    h.deliver(msg("y", "m3", 3), 3).await;
    assert_eq!(h.engine.unread_count(), 1);
    assert_eq!(h.engine.mark_all().await.expect("confirmed").marked, 1);
    assert_eq!(h.engine.mark_all().await.expect("no-op").marked, 0);
}

#[tokio::test(start_paused = true)]
async fn rapid_arrivals_never_show_more_than_three_toasts() {
    let h = Harness::start().await;
    let ids = ["a", "b", "c", "d", "e"];
    h.watch(&ids).await;

    let mut toasts = h.engine.watch_toasts();
    let peak = Arc::new(AtomicUsize::new(0));
    let observer = {
        let peak = Arc::clone(&peak);
        tokio::spawn(async move {
            while toasts.changed().await.is_ok() {
                let visible = toasts.borrow_and_update().len();
                peak.fetch_max(visible, Ordering::Relaxed);
            }
        })
    };

    for (n, conversation) in (1u64..).zip(ids) {
        h.deliver(msg(conversation, "m1", 1), n).await;
    }

    let visible = h.engine.toasts();
    assert_eq!(visible.len(), TOAST_CAPACITY);
    assert_eq!(visible[0].record.conversation_id, ConversationId::from("e"));
    assert!(peak.load(Ordering::Relaxed) <= TOAST_CAPACITY);
    assert_eq!(h.platform.tones(), 5);
    assert_eq!(h.engine.alert_stats().evicted, 2);
    observer.abort();
}

#[tokio::test(start_paused = true)]
async fn toasts_expire_or_dismiss_without_stray_timers() {
    let h = Harness::start().await;
    h.watch(&["x", "y"]).await;
    h.deliver(msg("x", "m1", 1), 1).await;
    h.deliver(msg("y", "m2", 2), 2).await;

    assert!(h.engine.dismiss_toast(&h.id("x", "m1")));
    assert_eq!(h.engine.active_toast_timers(), 1);

    tokio::time::sleep(Duration::from_millis(5001)).await;
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    assert!(h.engine.toasts().is_empty());
    assert_eq!(h.engine.active_toast_timers(), 0);
    let stats = h.engine.alert_stats();
    assert_eq!(stats.dismissed, 1);
    assert_eq!(stats.expired, 1);
}

#[tokio::test(start_paused = true)]
async fn push_click_opens_the_conversation() {
    let mut config = EngineConfig::default();
    config.alerts.push_enabled = true;
    let h = Harness::start_with(config, true).await;
    assert_eq!(
        h.engine.settings(),
        AlertSettings {
            sound_enabled: true,
            push_enabled: true
        }
    );

    let opened = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let opened = Arc::clone(&opened);
        h.engine
            .on_open(move |record| opened.lock().push(record.conversation_id.clone()));
    }

    h.watch(&["x"]).await;
    h.deliver(msg("x", "m1", 1), 1).await;

    let pushes = h.platform.visible_pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].title, "Client x");
    assert_eq!(pushes[0].body, "m1 in x");
    assert!(h.platform.click("conversation-x"));

    assert_eq!(*opened.lock(), vec![ConversationId::from("x")]);
    assert!(h.engine.toasts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn settings_toggle_sound_and_open_toast() {
    let h = Harness::start().await;
    h.engine.set_settings(AlertSettings {
        sound_enabled: false,
        push_enabled: false,
    });
    let opened = Arc::new(AtomicUsize::new(0));
    {
        let opened = Arc::clone(&opened);
        h.engine.on_open(move |_| {
            opened.fetch_add(1, Ordering::Relaxed);
        });
    }

    h.watch(&["x"]).await;
    h.deliver(msg("x", "m1", 1), 1).await;
    assert_eq!(h.platform.tones(), 0);

    assert!(h.engine.open_toast(&h.id("x", "m1")));
    assert!(!h.engine.open_toast(&h.id("x", "m1")));
    assert_eq!(opened.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn refused_subscription_surfaces_in_report_and_last_error() {
    let h = Harness::start().await;
    h.source.refuse(&ConversationId::from("y"), true);

    let report = h
        .engine
        .resync(&[
            Conversation::new("x", "client-x", "Client x"),
            Conversation::new("y", "client-y", "Client y"),
        ])
        .await;

    assert_eq!(report.started, vec![ConversationId::from("x")]);
    assert_eq!(report.failed, vec![ConversationId::from("y")]);
    let err = h.engine.last_error().expect("reported");
    assert_eq!(err.code().code(), "N2001");
    assert_eq!(
        h.engine.active_conversations(),
        vec![ConversationId::from("x")]
    );
}

#[tokio::test]
async fn own_messages_never_become_notifications() {
    let h = Harness::start().await;
    h.watch(&["x"]).await;

    let mut echo = msg("x", "m1", 1);
    echo.author_id = OwnerId::from(OWNER);
    h.source.publish(echo);
    h.deliver(msg("x", "m2", 2), 1).await;

    assert_eq!(h.engine.list().len(), 1);
    assert_eq!(h.engine.snapshot().ingest_attempts(), 1);
}

#[tokio::test]
async fn failed_persistence_is_a_warning_only() {
    let h = Harness::start().await;
    h.store.set_upserts_failing(true);
    h.watch(&["x"]).await;
    h.deliver(msg("x", "m1", 1), 1).await;

    let mut errors = h.engine.watch_errors();
    let err = errors
        .wait_for(Option::is_some)
        .await
        .expect("slot open")
        .clone()
        .expect("reported");
    assert!(err.is_warning());
    assert!(matches!(err, EngineError::PersistenceWrite { .. }));
    assert_eq!(h.engine.list().len(), 1);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn teardown_stops_everything_and_is_repeatable() {
    let h = Harness::start().await;
    h.watch(&["x"]).await;
    h.deliver(msg("x", "m1", 1), 1).await;

    h.engine.teardown();
    h.engine.teardown();
    tokio::task::yield_now().await;

    assert_eq!(h.source.subscriber_count(&ConversationId::from("x")), 0);
    assert!(h.engine.toasts().is_empty());
    assert_eq!(h.engine.active_toast_timers(), 0);
    assert_eq!(
        h.engine.clear_all().await.expect_err("closed"),
        EngineError::LedgerClosed
    );
}

#[tokio::test]
async fn sqlite_store_survives_engine_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("notifications.db");
    let source = Arc::new(MemorySource::new());

    let start = |store: Arc<SqliteStore>| {
        let source = Arc::clone(&source);
        async move {
            Engine::start(
                OwnerId::from(OWNER),
                Collaborators {
                    store: store as Arc<dyn DurableStore>,
                    source: source as Arc<dyn MessageSource>,
                    platform: Arc::new(RecordingPlatform::new(false)),
                },
                &EngineConfig::default(),
            )
            .await
            .expect("engine starts")
        }
    };

    let store = Arc::new(SqliteStore::open(&path).expect("open store"));
    let engine = start(Arc::clone(&store)).await;
    engine
        .resync(&[Conversation::new("x", "client-x", "Client x")])
        .await;
    for (n, event_id) in (1u64..).zip(["m1", "m2"]) {
        source.publish(msg("x", event_id, 1));
        let mut rx = engine.watch();
        rx.wait_for(|snap| snap.ingest_attempts() >= n)
            .await
            .expect("ledger running");
    }
    let first = NotificationId::derive(&OwnerId::from(OWNER), &ConversationId::from("x"), "m1");
    engine.mark_one(&first).await.expect("confirmed");
    // Writes anything still in flight before the session ends.
    assert_eq!(engine.refresh().await.expect("reloaded"), 2);
    engine.teardown();
    drop(engine);
    drop(store);

    let reopened = Arc::new(SqliteStore::open(&path).expect("reopen store"));
    let engine = start(reopened).await;
    assert_eq!(engine.list().len(), 2);
    assert_eq!(engine.unread_count(), 1);
    assert_eq!(engine.snapshot().read_state(&first), Some(ReadState::Read));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refresh_right_after_ingest_keeps_the_record() {
    let h = Harness::start().await;
    h.watch(&["x"]).await;

    for n in 1..=100usize {
        let minute = u32::try_from(n % 60).expect("minute");
        h.source.publish(msg("x", &format!("m{n}"), minute));
        let mut rx = h.engine.watch();
        rx.wait_for(|snap| snap.len() == n)
            .await
            .expect("ledger running");

        h.engine.refresh().await.expect("reloaded");
        assert_eq!(h.engine.list().len(), n, "record vanished on refresh {n}");
        assert_eq!(h.store.len(), n);
    }
    assert_eq!(h.engine.unread_count(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mark_one_right_after_ingest_confirms() {
    let h = Harness::start().await;
    h.watch(&["x"]).await;

    for n in 1..=100usize {
        let event_id = format!("m{n}");
        let minute = u32::try_from(n % 60).expect("minute");
        h.source.publish(msg("x", &event_id, minute));
        let mut rx = h.engine.watch();
        rx.wait_for(|snap| snap.len() == n)
            .await
            .expect("ledger running");

        let receipt = h
            .engine
            .mark_one(&h.id("x", &event_id))
            .await
            .expect("confirmed");
        assert_eq!(receipt.marked, 1);
    }
    assert_eq!(h.engine.unread_count(), 0);
    assert_eq!(h.engine.last_error(), None);
}

#[tokio::test]
async fn failed_write_is_retried_on_refresh() {
    let h = Harness::start().await;
    h.store.set_upserts_failing(true);
    h.watch(&["x"]).await;
    h.deliver(msg("x", "m1", 1), 1).await;
    h.engine
        .watch_errors()
        .wait_for(|err| matches!(err, Some(EngineError::PersistenceWrite { .. })))
        .await
        .expect("slot open");

    h.store.set_upserts_failing(false);
    assert_eq!(h.engine.refresh().await.expect("reloaded"), 1);
    assert_eq!(h.engine.list().len(), 1);
    assert_eq!(h.engine.unread_count(), 1);
    assert!(h.store.get(&h.id("x", "m1")).is_some());

    h.deliver(msg("x", "m1", 1), 2).await;
    assert_eq!(h.engine.list().len(), 1);
    assert_eq!(h.store.len(), 1);
}
