//! Loopback transport: file-backed history plus the in-process bus.
//!
//! A connected local transport mirrors what a second process on the same
//! machine would see. Sending appends to the shared history file, fans the
//! message out on the bus and echoes it synchronously to this transport's
//! own subscribers; connecting replays everything already stored before
//! returning.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bus::{BusFrame, LocalBus};
use crate::clog;
use crate::envelope::Envelope;
use crate::events::{SubscriptionId, Subscribers};
use crate::logging::{conv_id, msg_id};
use crate::storage::HistoryStore;

pub struct LocalTransport {
    conversation_id: String,
    store: HistoryStore,
    bus: LocalBus,
    origin: u64,
    subscribers: Subscribers<Envelope>,
    listener: Option<JoinHandle<()>>,
}

impl LocalTransport {
    pub fn new(conversation_id: impl Into<String>, store: HistoryStore, bus: LocalBus) -> Self {
        let origin = bus.register_origin();
        Self {
            conversation_id: conversation_id.into(),
            store,
            bus,
            origin,
            subscribers: Subscribers::new(),
            listener: None,
        }
    }

    /// Register a message callback. Fires for replayed history, own sends
    /// and bus traffic from other transports in this process.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn is_connected(&self) -> bool {
        self.listener.is_some()
    }

    /// Go live. Subscribes to the bus first, then replays the stored
    /// history to subscribers before returning, so nothing falls between
    /// backfill and live delivery. Connecting twice is a no-op.
    pub fn connect(&mut self) {
        if self.listener.is_some() {
            return;
        }
        let mut rx = self.bus.subscribe(&self.conversation_id);
        let subscribers = self.subscribers.clone();
        let own_origin = self.origin;
        self.listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    // Own sends already went to subscribers synchronously.
                    Ok(frame) if frame.origin == own_origin => {}
                    Ok(frame) => subscribers.publish(&frame.envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        clog!("local listener lagged, skipped {skipped} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let history = self.store.load(&self.conversation_id);
        clog!(
            "local transport connected to {} ({} stored messages)",
            conv_id(&self.conversation_id),
            history.len()
        );
        for message in &history {
            self.subscribers.publish(message);
        }
    }

    /// Append to history, fan out on the bus and echo to own subscribers.
    /// A failed write is logged and the message still goes out live. The
    /// envelope's own conversation decides where it lands, which may differ
    /// from the conversation this transport listens to. Before `connect`
    /// there is no bus channel yet, so the message persists and echoes
    /// locally without reaching other transports.
    pub fn send(&self, envelope: &Envelope) {
        let mut messages = self.store.load(&envelope.conversation_id);
        messages.push(envelope.clone());
        if let Err(err) = self.store.save(&envelope.conversation_id, &messages) {
            clog!("failed to persist {}: {err}", msg_id(&envelope.id));
        }
        if self.listener.is_some() {
            self.bus.publish(
                &envelope.conversation_id,
                BusFrame {
                    origin: self.origin,
                    envelope: envelope.clone(),
                },
            );
        }
        self.subscribers.publish(envelope);
    }

    /// Stop listening to the bus. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            clog!(
                "local transport disconnected from {}",
                conv_id(&self.conversation_id)
            );
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
