//! Notification data model.
//!
//! Identifiers are string newtypes so that an owner id can never be passed
//! where a conversation id is expected. [`NotificationId`] is a composite
//! key derived from `(owner, conversation, event)`: re-deriving the same
//! triple always yields the same id, which is what makes ingestion
//! idempotent.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default upper bound for [`NotificationRecord::message_preview`].
pub const DEFAULT_PREVIEW_CHARS: usize = 100;

const PREVIEW_ELLIPSIS: &str = "...";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity that owns a session (the signed-in trainer or client).
    OwnerId
);
string_id!(
    /// Logical channel between the owner and one counterpart.
    ConversationId
);
string_id!(
    /// Composite notification key, see [`NotificationId::derive`].
    NotificationId
);

impl NotificationId {
    /// Derive the deterministic composite key for an owner/conversation/event
    /// triple.
    ///
    /// Fields are length-prefixed before hashing so that `("ab", "c")` and
    /// `("a", "bc")` never collide.
    #[must_use]
    pub fn derive(owner: &OwnerId, conversation: &ConversationId, event_id: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in [owner.as_str(), conversation.as_str(), event_id] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        let hex = hasher.finalize().to_hex();
        Self(format!("ntf-{}", &hex.as_str()[..32]))
    }
}

/// A message event as delivered by a conversation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub event_id: String,
    pub conversation_id: ConversationId,
    pub author_id: OwnerId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A conversation the owner participates in.
///
/// Resync diffs on `id` only; the counterpart fields label the
/// notifications produced for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub counterpart_id: OwnerId,
    pub counterpart_name: String,
}

impl Conversation {
    #[must_use]
    pub fn new(
        id: impl Into<ConversationId>,
        counterpart_id: impl Into<OwnerId>,
        counterpart_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            counterpart_id: counterpart_id.into(),
            counterpart_name: counterpart_name.into(),
        }
    }
}

/// One notification in the ledger and in the store of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub conversation_id: ConversationId,
    pub counterpart_id: OwnerId,
    pub counterpart_name: String,
    pub message_preview: String,
    pub full_message: String,
    /// Time the underlying message was sent.
    pub timestamp: DateTime<Utc>,
    /// Time the ledger first saw the event.
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    /// Build the unread record for a first-seen event.
    #[must_use]
    pub fn from_event(
        owner: &OwnerId,
        event: &MessageEvent,
        conversation: &Conversation,
        preview_chars: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: NotificationId::derive(owner, &event.conversation_id, &event.event_id),
            conversation_id: event.conversation_id.clone(),
            counterpart_id: conversation.counterpart_id.clone(),
            counterpart_name: conversation.counterpart_name.clone(),
            message_preview: preview(&event.text, preview_chars),
            full_message: event.text.clone(),
            timestamp: event.timestamp,
            created_at: now,
            read: false,
            read_at: None,
        }
    }
}

/// Per-record read state as seen through the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadState {
    Unread,
    /// Marked read locally, store confirmation still in flight.
    PendingRead,
    Read,
}

impl fmt::Display for ReadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unread => "unread",
            Self::PendingRead => "pending_read",
            Self::Read => "read",
        };
        f.write_str(label)
    }
}

/// Truncate `text` to at most `max_chars` characters, ending in `...` when
/// anything was cut. Bounds too small to fit the ellipsis cut without it.
#[must_use]
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= PREVIEW_ELLIPSIS.len() {
        return text.chars().take(max_chars).collect();
    }
    let keep = max_chars - PREVIEW_ELLIPSIS.len();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(PREVIEW_ELLIPSIS);
    out
}
