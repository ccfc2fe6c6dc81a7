use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::NotificationPayload;

const BUS_CAPACITY: usize = 1024;

/// What subscribers of a channel receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEnvelope {
    pub channel: String,
    pub event_name: String,
    pub payload: NotificationPayload,
}

/// Publish-to-subscribers primitive.
///
/// Delivery is at most once: there is no queue and no retry, so a receiver
/// that subscribes after a publish never sees it.
pub trait Dispatcher: Send + Sync {
    /// Returns the number of subscribers reached. Zero is not an error.
    fn publish(&self, channel: &str, event_name: &str, payload: &NotificationPayload) -> usize;
}

/// In-process dispatcher backed by one broadcast channel per channel name.
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<DispatchEnvelope>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Get a new receiver for `channel`, creating the channel on first use.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<DispatchEnvelope> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Dispatcher for EventBus {
    fn publish(&self, channel: &str, event_name: &str, payload: &NotificationPayload) -> usize {
        let Some(tx) = self.channels.get(channel) else {
            tracing::debug!("no subscribers on {channel} for {event_name}");
            return 0;
        };
        let envelope = DispatchEnvelope {
            channel: channel.to_string(),
            event_name: event_name.to_string(),
            payload: payload.clone(),
        };
        match tx.send(envelope) {
            Ok(reached) => reached,
            Err(_) => {
                tracing::debug!("no subscribers on {channel} for {event_name}");
                0
            }
        }
    }
}
