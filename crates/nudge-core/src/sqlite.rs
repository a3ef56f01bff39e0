//! SQLite-backed store of record.
//!
//! Runtime defaults match the rest of the project:
//! - `journal_mode = WAL` so readers (other sessions, the CLI) never block
//!   the writer
//! - `busy_timeout = 5s` to absorb short lock contention between sessions
//!
//! Timestamps are stored as microseconds since the Unix epoch. Async store
//! calls run on tokio's blocking pool so a slow disk never stalls ingestion.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params, types::Type};

use crate::error::StoreError;
use crate::model::{ConversationId, NotificationId, NotificationRecord, OwnerId};
use crate::store::{DurableStore, UpsertOutcome};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    counterpart_id TEXT NOT NULL,
    counterpart_name TEXT NOT NULL,
    message_preview TEXT NOT NULL,
    full_message TEXT NOT NULL,
    timestamp_us INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0 CHECK (is_read IN (0, 1)),
    read_at_us INTEGER,
    CHECK (id LIKE 'ntf-%')
);

CREATE INDEX IF NOT EXISTS idx_notifications_owner_time
    ON notifications (owner_id, timestamp_us DESC, created_at_us DESC);
";

const MIGRATIONS: &[(u32, &str)] = &[(1, MIGRATION_V1_SQL)];

const SELECT_COLUMNS: &str = "id, conversation_id, counterpart_id, counterpart_name, \
     message_preview, full_message, timestamp_us, created_at_us, is_read, read_at_us";

/// Durable store over a single SQLite connection.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`, apply pragmas, and migrate.
    ///
    /// # Errors
    ///
    /// Returns an error if opening, configuring, or migrating fails.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("open notification store {}", path.display()))?;
        configure_connection(&conn).context("configure sqlite pragmas")?;
        migrate(&mut conn).context("apply store migrations")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if migrating the fresh database fails.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("open in-memory store")?;
        migrate(&mut conn).context("apply store migrations")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Look up one record by composite key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: &NotificationId) -> Result<Option<NotificationRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {SELECT_COLUMNS} FROM notifications WHERE id = ?1");
        Ok(conn
            .query_row(&sql, [id.as_str()], record_from_row)
            .optional()?)
    }

    /// Number of unread records for `owner`, straight from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn unread_count(&self, owner: &OwnerId) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE owner_id = ?1 AND is_read = 0",
            [owner.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&mut conn.lock()))
            .await
            .map_err(|err| StoreError::Unavailable(format!("store task failed: {err}")))?
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Read `PRAGMA user_version` as a `u32`.
///
/// # Errors
///
/// Returns an error if the pragma query fails or the value is out of range.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply pending migrations in ascending order.
///
/// # Errors
///
/// Returns an error if any migration fails.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.commit()?;
        current = *version;
    }

    Ok(current)
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(idx: usize, us: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(us).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {us}").into(),
        )
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let read_at_us: Option<i64> = row.get(9)?;
    Ok(NotificationRecord {
        id: NotificationId::new(row.get::<_, String>(0)?),
        conversation_id: ConversationId::new(row.get::<_, String>(1)?),
        counterpart_id: OwnerId::new(row.get::<_, String>(2)?),
        counterpart_name: row.get(3)?,
        message_preview: row.get(4)?,
        full_message: row.get(5)?,
        timestamp: from_micros(6, row.get(6)?)?,
        created_at: from_micros(7, row.get(7)?)?,
        read: row.get::<_, i64>(8)? != 0,
        read_at: read_at_us.map(|us| from_micros(9, us)).transpose()?,
    })
}

fn read_params(read: bool) -> (i64, Option<i64>) {
    let read_at = read.then(|| to_micros(Utc::now()));
    (i64::from(read), read_at)
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn upsert_if_absent(
        &self,
        owner: &OwnerId,
        record: &NotificationRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let owner = owner.clone();
        let record = record.clone();
        self.blocking(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO notifications (
                    id, owner_id, conversation_id, counterpart_id, counterpart_name,
                    message_preview, full_message, timestamp_us, created_at_us, is_read, read_at_us
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id.as_str(),
                    owner.as_str(),
                    record.conversation_id.as_str(),
                    record.counterpart_id.as_str(),
                    record.counterpart_name,
                    record.message_preview,
                    record.full_message,
                    to_micros(record.timestamp),
                    to_micros(record.created_at),
                    i64::from(record.read),
                    record.read_at.map(to_micros),
                ],
            )?;

            Ok(if inserted == 0 {
                UpsertOutcome::Existing
            } else {
                UpsertOutcome::Inserted
            })
        })
        .await
    }

    async fn query_by_owner(&self, owner: &OwnerId) -> Result<Vec<NotificationRecord>, StoreError> {
        let owner = owner.clone();
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM notifications WHERE owner_id = ?1 \
                 ORDER BY timestamp_us DESC, created_at_us DESC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([owner.as_str()], record_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn update_read_state(&self, id: &NotificationId, read: bool) -> Result<(), StoreError> {
        let id = id.clone();
        self.blocking(move |conn| {
            let (is_read, read_at) = read_params(read);
            let changed = conn.execute(
                "UPDATE notifications SET is_read = ?1, read_at_us = ?2 WHERE id = ?3",
                params![is_read, read_at, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::Rejected(format!("unknown notification {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn batch_update_read_state(
        &self,
        ids: &[NotificationId],
        read: bool,
    ) -> Result<(), StoreError> {
        let ids = ids.to_vec();
        self.blocking(move |conn| {
            let (is_read, read_at) = read_params(read);
            let tx = conn.transaction()?;
            for id in &ids {
                let changed = tx.execute(
                    "UPDATE notifications SET is_read = ?1, read_at_us = ?2 WHERE id = ?3",
                    params![is_read, read_at, id.as_str()],
                )?;
                if changed == 0 {
                    // Dropping the transaction rolls back earlier updates.
                    return Err(StoreError::Rejected(format!("unknown notification {id}")));
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, conversation: &str, offset_secs: i64) -> NotificationRecord {
        let ts = DateTime::<Utc>::from_timestamp(1_709_280_000 + offset_secs, 0)
            .expect("valid timestamp");
        NotificationRecord {
            id: NotificationId::from(id),
            conversation_id: ConversationId::from(conversation),
            counterpart_id: OwnerId::from("client-1"),
            counterpart_name: "Riley".into(),
            message_preview: "Can we move Thursday?".into(),
            full_message: "Can we move Thursday? Knee is sore.".into(),
            timestamp: ts,
            created_at: ts,
            read: false,
            read_at: None,
        }
    }

    fn temp_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = SqliteStore::open(&dir.path().join("nudge.sqlite3")).expect("open store");
        (dir, store)
    }

    #[test]
    fn open_sets_wal_and_migrates() {
        let (_dir, store) = temp_store();
        let conn = store.conn.lock();

        let journal_mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("query journal_mode");
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

        let version = current_schema_version(&conn).expect("schema version");
        assert_eq!(version, LATEST_SCHEMA_VERSION);
    }

    #[test]
    fn migrate_is_idempotent() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[tokio::test]
    async fn records_round_trip_in_time_order() {
        let (_dir, store) = temp_store();
        let owner = OwnerId::from("coach-1");

        let older = record("ntf-older", "c1", 0);
        let newer = record("ntf-newer", "c2", 60);
        assert_eq!(
            store.upsert_if_absent(&owner, &older).await,
            Ok(UpsertOutcome::Inserted)
        );
        store.upsert_if_absent(&owner, &newer).await.expect("insert");
        assert_eq!(
            store.upsert_if_absent(&owner, &older).await,
            Ok(UpsertOutcome::Existing)
        );

        let listed = store.query_by_owner(&owner).await.expect("query");
        assert_eq!(listed, vec![newer, older]);
    }

    #[tokio::test]
    async fn read_updates_apply_and_reject_unknown_ids() {
        let (_dir, store) = temp_store();
        let owner = OwnerId::from("coach-1");
        store
            .upsert_if_absent(&owner, &record("ntf-a", "c1", 0))
            .await
            .expect("insert");
        store
            .upsert_if_absent(&owner, &record("ntf-b", "c1", 1))
            .await
            .expect("insert");

        store
            .update_read_state(&NotificationId::from("ntf-a"), true)
            .await
            .expect("mark read");
        assert_eq!(store.unread_count(&owner).expect("count"), 1);

        let batch = [NotificationId::from("ntf-b"), NotificationId::from("ntf-zzz")];
        assert!(store.batch_update_read_state(&batch, true).await.is_err());
        assert_eq!(
            store.unread_count(&owner).expect("count"),
            1,
            "failed batch must not partially apply"
        );

        let a = store
            .get(&NotificationId::from("ntf-a"))
            .expect("get")
            .expect("present");
        assert!(a.read);
        assert!(a.read_at.is_some());

        assert!(
            store
                .update_read_state(&NotificationId::from("ntf-missing"), true)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    #[allow(clippy::await_holding_lock)]
    async fn busy_connection_leaves_the_runtime_free() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let guard = store.conn.lock();

        let query = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.query_by_owner(&OwnerId::from("coach-1")).await }
        });

        // The query waits for the lock on the blocking pool, not on the
        // runtime's only worker, so timers still fire.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!query.is_finished());

        drop(guard);
        let listed = query.await.expect("join").expect("query");
        assert!(listed.is_empty());
    }
}
