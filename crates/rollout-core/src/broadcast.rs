//! Status broadcast channel
//!
//! Fan-out of deployment status changes to any number of observers using a
//! tokio broadcast channel. Publishing never waits on subscribers: a slow
//! subscriber lags and loses the oldest messages instead of blocking the
//! publisher.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::UtcDateTime;

/// A status change published for one deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub deployment_id: String,
    pub status: String,
    pub message: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub published_at: UtcDateTime,
}

impl StatusUpdate {
    pub fn new(
        deployment_id: impl Into<String>,
        status: impl ToString,
        message: impl Into<String>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            status: status.to_string(),
            message: message.into(),
            metadata: HashMap::new(),
            published_at: chrono::Utc::now(),
        }
    }

    pub fn with_metadata<V: Serialize>(mut self, key: &str, value: V) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.metadata.insert(key.to_string(), value);
        }
        self
    }
}

/// Best-effort publish port; no acknowledgement is expected
pub trait StatusBroadcaster: Send + Sync {
    fn publish(&self, update: StatusUpdate);

    fn subscribe(&self) -> broadcast::Receiver<StatusUpdate>;
}

#[derive(Clone)]
pub struct BroadcastStatusChannel {
    sender: broadcast::Sender<StatusUpdate>,
}

impl BroadcastStatusChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastStatusChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StatusBroadcaster for BroadcastStatusChannel {
    fn publish(&self, update: StatusUpdate) {
        let subscriber_count = self.sender.receiver_count();
        if subscriber_count == 0 {
            debug!(
                "📭 No subscribers for status update of deployment {} ({})",
                update.deployment_id, update.status
            );
            return;
        }

        let deployment_id = update.deployment_id.clone();
        match self.sender.send(update) {
            Ok(delivered) => {
                debug!(
                    "📡 Status update for deployment {} sent to {} subscribers",
                    deployment_id, delivered
                );
            }
            Err(e) => {
                warn!(
                    "Failed to broadcast status update for deployment {}: {}",
                    deployment_id, e
                );
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        debug!("📡 New status subscriber");
        self.sender.subscribe()
    }
}

/// Broadcaster that drops every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroadcaster;

impl StatusBroadcaster for NoopBroadcaster {
    fn publish(&self, _update: StatusUpdate) {}

    fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        broadcast::channel(1).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let channel = BroadcastStatusChannel::new(16);
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        channel.publish(StatusUpdate::new("dep-1", "running", "Stage build started"));

        assert_eq!(first.recv().await.unwrap().status, "running");
        assert_eq!(second.recv().await.unwrap().deployment_id, "dep-1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_fail() {
        let channel = BroadcastStatusChannel::new(4);
        channel.publish(StatusUpdate::new("dep-1", "success", "done"));
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let channel = BroadcastStatusChannel::new(2);
        let mut slow = channel.subscribe();

        for i in 0..5 {
            channel.publish(StatusUpdate::new("dep-1", "running", format!("tick {}", i)));
        }

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
