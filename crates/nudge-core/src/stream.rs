//! Per-conversation message streams.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SourceError;
use crate::model::{ConversationId, MessageEvent};

/// Receiving end of one conversation subscription. Dropping it cancels the
/// subscription at the source.
pub type EventReceiver = mpsc::UnboundedReceiver<MessageEvent>;

/// Transport that delivers message events, one stream per conversation.
///
/// Each stream carries only the latest event of its conversation: a fresh
/// subscription first yields the current latest message, then each newer
/// one as it arrives.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn subscribe(&self, conversation: &ConversationId) -> Result<EventReceiver, SourceError>;
}
