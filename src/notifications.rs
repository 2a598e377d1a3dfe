//! Notification capability used by the event processor.
//!
//! The core never talks to a transport directly; it emits events, and the
//! transport layer registers per-user channels here.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::events::Event;

/// Abstract "notify this user" capability injected into the event processor.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: Uuid, event: &Event) -> Result<(), String>;
}

/// Connection registry keyed by user id, owned by the transport layer.
///
/// A user with no registered channel simply receives nothing; registration
/// and removal are the transport's responsibility.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<Uuid, mpsc::Sender<Event>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: Uuid, sender: mpsc::Sender<Event>) {
        self.channels.insert(user_id, sender);
    }

    pub fn unregister(&self, user_id: Uuid) {
        self.channels.remove(&user_id);
    }

    pub fn connected_users(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl Notifier for ChannelRegistry {
    async fn notify(&self, user_id: Uuid, event: &Event) -> Result<(), String> {
        let Some(sender) = self.channels.get(&user_id).map(|s| s.clone()) else {
            debug!(user_id = %user_id, "No channel registered for user; dropping notification");
            return Ok(());
        };
        sender
            .send(event.clone())
            .await
            .map_err(|e| format!("Failed to push notification: {}", e))
    }
}

/// No-op notifier for tests and headless deployments.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _user_id: Uuid, _event: &Event) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;

    #[tokio::test]
    async fn registry_routes_to_registered_channel() {
        let registry = ChannelRegistry::new();
        let user_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(user_id, tx);

        let event = Event::ReturnReceived {
            return_id: Uuid::new_v4(),
        };
        registry.notify(user_id, &event).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(Event::ReturnReceived { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_user_is_not_an_error() {
        let registry = ChannelRegistry::new();
        let event = Event::ReturnReceived {
            return_id: Uuid::new_v4(),
        };
        assert!(registry.notify(Uuid::new_v4(), &event).await.is_ok());
    }
}
