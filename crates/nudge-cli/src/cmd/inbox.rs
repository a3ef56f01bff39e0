//! `nudge inbox`: inspect and repair a SQLite notification store.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use nudge_core::model::{NotificationId, NotificationRecord, OwnerId};
use nudge_core::sqlite::SqliteStore;
use nudge_core::store::DurableStore;
use serde::Serialize;
use tracing::info;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct InboxArgs {
    /// Path to the notification database.
    #[arg(long)]
    pub db: PathBuf,

    /// Owner whose notifications to read.
    #[arg(long)]
    pub owner: String,

    #[command(subcommand)]
    pub command: InboxCommand,
}

#[derive(Subcommand, Debug)]
pub enum InboxCommand {
    #[command(
        about = "List stored notifications, most recent first",
        after_help = "EXAMPLES:\n    nudge inbox --db nudge.sqlite3 --owner coach-1 list\n\n\
                      # Unread only, newest 10\n    nudge inbox --db nudge.sqlite3 --owner coach-1 list --unread --limit 10"
    )]
    List(ListArgs),

    #[command(
        about = "Mark notifications read in the store",
        after_help = "EXAMPLES:\n    nudge inbox --db nudge.sqlite3 --owner coach-1 read ntf-0123...\n\n\
                      # Everything unread for the owner\n    nudge inbox --db nudge.sqlite3 --owner coach-1 read --all"
    )]
    Read(ReadArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only unread notifications.
    #[arg(long)]
    pub unread: bool,

    /// Only notifications from this conversation.
    #[arg(long)]
    pub conversation: Option<String>,

    /// Maximum number of rows.
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    /// Notification ids to mark read.
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub ids: Vec<String>,

    /// Mark every unread notification for the owner.
    #[arg(long)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
struct ListOutput {
    owner: String,
    total: usize,
    unread: usize,
    notifications: Vec<NotificationRow>,
}

#[derive(Debug, Serialize)]
struct NotificationRow {
    id: String,
    conversation_id: String,
    counterpart: String,
    preview: String,
    timestamp: DateTime<Utc>,
    read: bool,
}

impl From<&NotificationRecord> for NotificationRow {
    fn from(record: &NotificationRecord) -> Self {
        Self {
            id: record.id.to_string(),
            conversation_id: record.conversation_id.to_string(),
            counterpart: record.counterpart_name.clone(),
            preview: record.message_preview.clone(),
            timestamp: record.timestamp,
            read: record.read,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReadOutput {
    owner: String,
    marked: usize,
    unread: usize,
}

/// Execute `nudge inbox`.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or queried.
pub fn run_inbox(args: &InboxArgs, output: OutputMode) -> Result<()> {
    let store = SqliteStore::open(&args.db)?;
    let owner = OwnerId::from(args.owner.as_str());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .context("build runtime")?;

    match &args.command {
        InboxCommand::List(list) => runtime.block_on(list_inbox(&store, &owner, list, output)),
        InboxCommand::Read(read) => runtime.block_on(mark_inbox(&store, &owner, read, output)),
    }
}

async fn list_inbox(
    store: &SqliteStore,
    owner: &OwnerId,
    args: &ListArgs,
    output: OutputMode,
) -> Result<()> {
    let records = store.query_by_owner(owner).await?;
    let unread = records.iter().filter(|r| !r.read).count();
    let total = records.len();

    let notifications: Vec<NotificationRow> = records
        .iter()
        .filter(|r| !args.unread || !r.read)
        .filter(|r| {
            args.conversation
                .as_deref()
                .is_none_or(|c| r.conversation_id.as_str() == c)
        })
        .take(args.limit.unwrap_or(usize::MAX))
        .map(NotificationRow::from)
        .collect();

    let out = ListOutput {
        owner: owner.to_string(),
        total,
        unread,
        notifications,
    };

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(w, "inbox owner={} total={} unread={}", out.owner, out.total, out.unread)?;
            for row in &out.notifications {
                writeln!(
                    w,
                    "{}  {}  {}  {}  {}",
                    row.id,
                    if row.read { "read" } else { "unread" },
                    row.timestamp.to_rfc3339(),
                    row.counterpart,
                    row.preview
                )?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, &format!("Inbox for {}", out.owner))?;
            pretty_kv(w, "Total", out.total.to_string())?;
            pretty_kv(w, "Unread", out.unread.to_string())?;
            if out.notifications.is_empty() {
                return Ok(());
            }
            writeln!(w)?;
            for row in &out.notifications {
                let marker = if row.read { ' ' } else { '*' };
                writeln!(
                    w,
                    "{marker} {}  {}",
                    row.timestamp.format("%Y-%m-%d %H:%M"),
                    row.counterpart
                )?;
                writeln!(w, "    {}", row.preview)?;
                writeln!(w, "    {} ({})", row.id, row.conversation_id)?;
            }
            Ok(())
        },
    )
}

async fn mark_inbox(
    store: &SqliteStore,
    owner: &OwnerId,
    args: &ReadArgs,
    output: OutputMode,
) -> Result<()> {
    let records = store.query_by_owner(owner).await?;
    let ids: Vec<NotificationId> = if args.all {
        records.into_iter().filter(|r| !r.read).map(|r| r.id).collect()
    } else {
        let known: HashSet<&NotificationId> = records.iter().map(|r| &r.id).collect();
        let mut ids = Vec::with_capacity(args.ids.len());
        for raw in &args.ids {
            let id = NotificationId::from(raw.as_str());
            if !known.contains(&id) {
                bail!("no notification {id} for owner {owner}");
            }
            ids.push(id);
        }
        ids
    };

    if !ids.is_empty() {
        store.batch_update_read_state(&ids, true).await?;
        info!(owner = %owner, marked = ids.len(), "marked notifications read");
    }

    let out = ReadOutput {
        owner: owner.to_string(),
        marked: ids.len(),
        unread: store.unread_count(owner)?,
    };

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "read owner={} marked={} unread={}",
                out.owner, out.marked, out.unread
            )
        },
        |out, w| {
            pretty_kv(w, "Marked", out.marked.to_string())?;
            pretty_kv(w, "Unread", out.unread.to_string())
        },
    )
}
