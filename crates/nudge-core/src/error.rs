use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::model::{ConversationId, NotificationId};

/// Machine-readable error codes for callers that branch on failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    SubscriptionStartFailed,
    PersistenceWriteFailed,
    ReadStateConfirmFailed,
    FullReloadFailed,
    LedgerClosed,
}

impl ErrorCode {
    /// Stable code identifier (`N####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "N1001",
            Self::SubscriptionStartFailed => "N2001",
            Self::PersistenceWriteFailed => "N3001",
            Self::ReadStateConfirmFailed => "N3002",
            Self::FullReloadFailed => "N3003",
            Self::LedgerClosed => "N4001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::SubscriptionStartFailed => "Conversation subscription failed to start",
            Self::PersistenceWriteFailed => "Notification could not be persisted",
            Self::ReadStateConfirmFailed => "Read-state change was rejected by the store",
            Self::FullReloadFailed => "Notification reload failed",
            Self::LedgerClosed => "Notification session already torn down",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the nudge config file and retry."),
            Self::SubscriptionStartFailed => {
                Some("Call resync again with the same conversation list to retry.")
            }
            Self::PersistenceWriteFailed => {
                Some("The notification is kept locally; a later refresh reconciles it.")
            }
            Self::ReadStateConfirmFailed => Some("The change was rolled back. Retry the action."),
            Self::FullReloadFailed => Some("Showing last known notifications. Retry refresh."),
            Self::LedgerClosed => Some("Start a new session for the signed-in identity."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Failure reported by a [`crate::store::DurableStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected the write: {0}")]
    Rejected(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Failure reported by a [`crate::stream::MessageSource`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("subscription refused for conversation {conversation}: {reason}")]
    Refused {
        conversation: ConversationId,
        reason: String,
    },
    #[error("message source closed")]
    Closed,
}

/// Errors surfaced by the engine, either returned or published through
/// [`ErrorSlot`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{}: subscription for {conversation} failed to start: {source}", ErrorCode::SubscriptionStartFailed.code())]
    SubscriptionStart {
        conversation: ConversationId,
        #[source]
        source: SourceError,
    },
    #[error("{}: notification {id} was not persisted: {source}", ErrorCode::PersistenceWriteFailed.code())]
    PersistenceWrite {
        id: NotificationId,
        #[source]
        source: StoreError,
    },
    #[error("{}: read-state confirm for {count} notification(s) failed: {source}", ErrorCode::ReadStateConfirmFailed.code())]
    ReadStateConfirm {
        count: usize,
        #[source]
        source: StoreError,
    },
    #[error("{}: reload from store failed: {source}", ErrorCode::FullReloadFailed.code())]
    FullReload {
        #[source]
        source: StoreError,
    },
    #[error("{}: ledger is no longer running", ErrorCode::LedgerClosed.code())]
    LedgerClosed,
}

impl EngineError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::SubscriptionStart { .. } => ErrorCode::SubscriptionStartFailed,
            Self::PersistenceWrite { .. } => ErrorCode::PersistenceWriteFailed,
            Self::ReadStateConfirm { .. } => ErrorCode::ReadStateConfirmFailed,
            Self::FullReload { .. } => ErrorCode::FullReloadFailed,
            Self::LedgerClosed => ErrorCode::LedgerClosed,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Warnings leave local state authoritative and need no caller action.
    #[must_use]
    pub const fn is_warning(&self) -> bool {
        matches!(self, Self::PersistenceWrite { .. })
    }
}

/// Single place where asynchronous failures become visible to callers.
///
/// Stream callbacks and fire-and-forget writes run outside normal
/// call/return flow, so they publish here instead of returning.
#[derive(Debug, Clone)]
pub struct ErrorSlot {
    tx: Arc<watch::Sender<Option<EngineError>>>,
}

impl Default for ErrorSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorSlot {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record `err` as the latest error and log it at the matching level.
    pub fn report(&self, err: EngineError) {
        if err.is_warning() {
            tracing::warn!(code = err.code().code(), "{err}");
        } else {
            tracing::error!(code = err.code().code(), "{err}");
        }
        self.tx.send_replace(Some(err));
    }

    #[must_use]
    pub fn last(&self) -> Option<EngineError> {
        self.tx.borrow().clone()
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Watch for newly reported errors.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Option<EngineError>> {
        self.tx.subscribe()
    }
}
