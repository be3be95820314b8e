//! Cross-instance notifications within one storage scope.
//!
//! Delivery is best-effort and at-least-once: every consumer treats a
//! message as "go re-read the Local Store", so duplicates are harmless. A
//! subscriber that falls behind is told to do a full refresh instead of
//! replaying what it missed.

use crate::entity::{Checkpoint, EntityId};
use crate::leader::InstanceId;
use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceMessage {
    /// The sender wrote these entities to the Local Store
    DataChanged { entity_ids: Vec<EntityId> },
    /// The sender finished a sync cycle that changed local or remote state
    SyncCompleted {
        checkpoint: Checkpoint,
        entity_ids: Vec<EntityId>,
    },
    /// The sender gave up leadership; waiting instances may acquire now
    LeadershipReleased,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: InstanceId,
    pub message: InstanceMessage,
}

/// What a subscriber should act on next.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Message {
        origin: InstanceId,
        message: InstanceMessage,
    },
    /// Messages were dropped; re-read everything from the Local Store
    Resync,
}

/// Publish/subscribe hub shared by the instances of a storage scope.
#[derive(Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<Envelope>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Send to every subscribed instance; the sender's own subscription
    /// drops it on receipt. Returns how many subscriptions the message was
    /// queued for, the sender's included (0 when nobody listens).
    pub fn publish(&self, origin: &InstanceId, message: InstanceMessage) -> usize {
        self.sender
            .send(Envelope {
                origin: origin.clone(),
                message,
            })
            .unwrap_or(0)
    }

    /// Subscribe on behalf of `instance`; its own messages are filtered out.
    pub fn subscribe(&self, instance: &InstanceId) -> InstanceSubscription {
        InstanceSubscription {
            instance: instance.clone(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InstanceSubscription {
    instance: InstanceId,
    receiver: broadcast::Receiver<Envelope>,
}

impl InstanceSubscription {
    /// Receive the next sibling notification. Returns `None` once every
    /// broadcaster handle is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.origin == self.instance => continue,
                Ok(envelope) => {
                    return Some(Notification::Message {
                        origin: envelope.origin,
                        message: envelope.message,
                    })
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "[broadcast] {} lagged behind by {} messages, resyncing",
                        self.instance, skipped
                    );
                    return Some(Notification::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_skip_their_own_messages() {
        let hub = Broadcaster::new();
        let a = InstanceId::new("a");
        let b = InstanceId::new("b");
        let mut sub_a = hub.subscribe(&a);
        let mut sub_b = hub.subscribe(&b);

        hub.publish(&a, InstanceMessage::LeadershipReleased);
        hub.publish(
            &b,
            InstanceMessage::DataChanged {
                entity_ids: vec![EntityId::from("task-1")],
            },
        );

        assert_eq!(
            sub_a.recv().await,
            Some(Notification::Message {
                origin: b.clone(),
                message: InstanceMessage::DataChanged {
                    entity_ids: vec![EntityId::from("task-1")]
                },
            })
        );
        assert_eq!(
            sub_b.recv().await,
            Some(Notification::Message {
                origin: a,
                message: InstanceMessage::LeadershipReleased,
            })
        );
    }

    #[tokio::test]
    async fn test_lagging_subscriber_resyncs() {
        let hub = Broadcaster::new();
        let a = InstanceId::new("a");
        let mut sub = hub.subscribe(&InstanceId::new("b"));

        for _ in 0..(CHANNEL_CAPACITY + 10) {
            hub.publish(&a, InstanceMessage::LeadershipReleased);
        }
        assert_eq!(sub.recv().await, Some(Notification::Resync));
        // Delivery continues after the resync
        assert!(matches!(
            sub.recv().await,
            Some(Notification::Message { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_count_includes_own_subscription() {
        let hub = Broadcaster::new();
        let a = InstanceId::new("a");
        let _sub_a = hub.subscribe(&a);
        let _sub_b = hub.subscribe(&InstanceId::new("b"));
        assert_eq!(hub.publish(&a, InstanceMessage::LeadershipReleased), 2);
    }

    #[tokio::test]
    async fn test_publish_without_listeners() {
        let hub = Broadcaster::new();
        assert_eq!(hub.publish(&InstanceId::new("a"), InstanceMessage::LeadershipReleased), 0);
    }
}
