//! In-process message bus backing the local transport.
//!
//! One broadcast channel per conversation, created lazily on first use.
//! Publishing to a conversation nobody listens to is a silent no-op, and
//! frames carry the publishing transport's origin tag so a transport can
//! skip its own traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::envelope::Envelope;

/// Buffered frames per conversation before slow receivers start lagging.
pub const BUS_CHANNEL_CAPACITY: usize = 128;

/// A message on the bus, tagged with the publisher's origin.
#[derive(Debug, Clone)]
pub struct BusFrame {
    pub origin: u64,
    pub envelope: Envelope,
}

/// Cloneable handle to a process-wide bus. Clones share the same channels.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<BusFrame>>>>,
    next_origin: Arc<AtomicU64>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a bus-unique origin tag for one transport instance.
    pub fn register_origin(&self) -> u64 {
        self.next_origin.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Subscribe to a conversation's live feed.
    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<BusFrame> {
        let mut channels = self.channels.lock().expect("bus channel map poisoned");
        channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a frame to everyone subscribed to the conversation.
    pub fn publish(&self, conversation_id: &str, frame: BusFrame) {
        let sender = {
            let channels = self.channels.lock().expect("bus channel map poisoned");
            channels.get(conversation_id).cloned()
        };
        if let Some(sender) = sender {
            // Send only fails when every receiver is gone; dropping the
            // frame matches the no-subscriber case.
            let _ = sender.send(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(origin: u64, text: &str) -> BusFrame {
        BusFrame {
            origin,
            envelope: Envelope::new("default", "alice", text),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_frame() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("default");

        bus.publish("default", frame(1, "hola"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.origin, 1);
        assert_eq!(received.envelope.text, "hola");
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let bus = LocalBus::new();
        let mut standup = bus.subscribe("standup");
        let mut random = bus.subscribe("random");

        bus.publish("standup", frame(1, "daily"));

        assert_eq!(standup.recv().await.unwrap().envelope.text, "daily");
        assert!(matches!(
            random.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = LocalBus::new();
        bus.publish("default", frame(1, "nobody home"));

        // Only frames published after subscribing arrive.
        let mut rx = bus.subscribe("default");
        bus.publish("default", frame(1, "second"));
        assert_eq!(rx.recv().await.unwrap().envelope.text, "second");
    }

    #[test]
    fn origins_are_unique_per_bus() {
        let bus = LocalBus::new();
        let first = bus.register_origin();
        let second = bus.clone().register_origin();
        assert_ne!(first, second);
    }
}
