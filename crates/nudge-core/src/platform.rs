//! Platform alert surface: tones and system notifications.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{ConversationId, NotificationId};

/// Invoked when the user clicks a platform notification.
pub type ClickHandler = Arc<dyn Fn() + Send + Sync>;

/// Payload for a platform (system) notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    /// Stable per conversation so the platform coalesces repeats.
    pub tag: String,
    pub notification_id: NotificationId,
    pub conversation_id: ConversationId,
}

impl PushNotification {
    /// Tag shared by every push for `conversation`.
    #[must_use]
    pub fn tag_for(conversation: &ConversationId) -> String {
        format!("conversation-{conversation}")
    }
}

/// Host alerting capabilities.
///
/// `play_tone` must return immediately; `show_notification` may take as
/// long as it needs because the dispatcher runs it on its own task.
#[async_trait]
pub trait AlertPlatform: Send + Sync {
    /// Whether notification permission was previously granted.
    fn has_permission(&self) -> bool;

    fn play_tone(&self);

    async fn show_notification(&self, push: PushNotification, on_click: ClickHandler);
}
