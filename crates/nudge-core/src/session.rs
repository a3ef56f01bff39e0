//! Identity lifecycle: at most one [`Engine`] per host, replaced whenever
//! the signed-in identity changes.

use anyhow::Result;
use tracing::info;

use crate::config::EngineConfig;
use crate::engine::{Collaborators, Engine};
use crate::model::OwnerId;

#[derive(Debug)]
pub struct SessionHost {
    collaborators: Collaborators,
    config: EngineConfig,
    engine: Option<Engine>,
}

impl SessionHost {
    #[must_use]
    pub const fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        Self {
            collaborators,
            config,
            engine: None,
        }
    }

    /// React to the identity becoming known, changing, or going away.
    ///
    /// The previous engine, if any, is torn down before a new one starts.
    /// Reporting the identity that is already active is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the new engine cannot start; the host is left
    /// without an engine in that case.
    pub async fn identity_changed(&mut self, owner: Option<OwnerId>) -> Result<Option<&Engine>> {
        let unchanged = match (&self.engine, &owner) {
            (Some(engine), Some(owner)) => engine.owner() == owner,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return Ok(self.engine.as_ref());
        }

        if let Some(previous) = self.engine.take() {
            info!(owner = %previous.owner(), "identity changed, ending session");
            previous.teardown();
        }

        let Some(owner) = owner else {
            return Ok(None);
        };
        let engine = Engine::start(owner, self.collaborators.clone(), &self.config).await?;
        let engine: &Engine = self.engine.insert(engine);
        Ok(Some(engine))
    }

    #[must_use]
    pub const fn engine(&self) -> Option<&Engine> {
        self.engine.as_ref()
    }

    /// Tear down the current engine, if any. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySource, MemoryStore, RecordingPlatform};
    use crate::model::{Conversation, MessageEvent};
    use crate::stream::MessageSource;
    use std::sync::Arc;

    fn host(source: &Arc<MemorySource>) -> SessionHost {
        SessionHost::new(
            Collaborators {
                store: Arc::new(MemoryStore::new()),
                source: Arc::clone(source) as Arc<dyn MessageSource>,
                platform: Arc::new(RecordingPlatform::new(false)),
            },
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn identity_lifecycle() {
        let source = Arc::new(MemorySource::new());
        let mut host = host(&source);

        assert!(host.identity_changed(None).await.expect("no-op").is_none());

        let engine = host
            .identity_changed(Some("coach".into()))
            .await
            .expect("start")
            .expect("engine");
        engine.resync(&[Conversation::new("x", "client", "Client")]).await;
        assert_eq!(source.subscriber_count(&"x".into()), 1);

        host.identity_changed(Some("coach".into()))
            .await
            .expect("same identity");
        assert_eq!(source.subscribe_calls(), 1);

        let next = host
            .identity_changed(Some("client".into()))
            .await
            .expect("start")
            .expect("engine");
        assert_eq!(next.owner().as_str(), "client");
        tokio::task::yield_now().await;
        assert_eq!(source.subscriber_count(&"x".into()), 0);

        host.identity_changed(None).await.expect("sign out");
        assert!(host.engine().is_none());
        host.shutdown();
    }

    #[tokio::test]
    async fn engines_for_different_owners_are_independent() {
        let source = Arc::new(MemorySource::new());
        let mut coach = host(&source);
        let mut client = host(&source);
        let conv = Conversation::new("x", "peer", "Peer");

        for (host, owner) in [(&mut coach, "coach"), (&mut client, "client")] {
            let engine = host
                .identity_changed(Some(owner.into()))
                .await
                .expect("start")
                .expect("engine");
            engine.resync(std::slice::from_ref(&conv)).await;
        }

        source.publish(MessageEvent {
            event_id: "m1".into(),
            conversation_id: "x".into(),
            author_id: "coach".into(),
            text: "from coach".into(),
            timestamp: chrono::Utc::now(),
        });

        let client_engine = client.engine().expect("engine");
        let mut rx = client_engine.watch();
        rx.wait_for(|snap| snap.len() == 1).await.expect("ledger running");

        let coach_engine = coach.engine().expect("engine");
        assert!(coach_engine.list().is_empty(), "own message is not a notification");
        assert_eq!(client_engine.unread_count(), 1);
    }
}
