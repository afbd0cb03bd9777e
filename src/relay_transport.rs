//! Client-side relay transport.
//!
//! Two-phase lifecycle: [`RelayTransport::new`] only validates configuration
//! and fails fast when no server url is known; [`RelayTransport::connect`]
//! dials the relay's WebSocket endpoint, performs the `connect` handshake
//! and joins the conversation. After that a reader task feeds the history
//! backfill and live messages to subscribers while a writer task drains the
//! outbound queue.
//!
//! The relay tags this connection's own live broadcasts with the origin
//! sent during the handshake; those are dropped here because the client
//! already echoed the message locally when it was sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::clog;
use crate::envelope::{new_message_id, Envelope};
use crate::events::{SubscriptionId, Subscribers};
use crate::logging::msg_id;
use crate::protocol::{AuthPayload, ClientFrame, ConnectPayload, SendPayload, ServerFrame};

#[derive(Debug)]
pub enum TransportError {
    /// Relay transport was requested without a server url to dial.
    MissingServerUrl,
    Connect(String),
    Http(String),
    Protocol(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::MissingServerUrl => {
                write!(f, "relay transport requires a server url")
            }
            TransportError::Connect(detail) => write!(f, "relay connect failed: {detail}"),
            TransportError::Http(detail) => write!(f, "relay http request failed: {detail}"),
            TransportError::Protocol(detail) => write!(f, "relay protocol error: {detail}"),
        }
    }
}

impl std::error::Error for TransportError {}

pub struct RelayTransport {
    server_url: String,
    conversation_id: String,
    token: Option<String>,
    origin: String,
    subscribers: Subscribers<Envelope>,
    connected: Arc<AtomicBool>,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl RelayTransport {
    /// Validate configuration without touching the network.
    pub fn new(
        server_url: Option<&str>,
        conversation_id: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, TransportError> {
        let server_url = match server_url {
            Some(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            _ => return Err(TransportError::MissingServerUrl),
        };
        Ok(Self {
            server_url,
            conversation_id: conversation_id.into(),
            token,
            origin: new_message_id(),
            subscribers: Subscribers::new(),
            connected: Arc::new(AtomicBool::new(false)),
            outbound: None,
            writer: None,
            reader: None,
        })
    }

    /// Register a message callback. Fires for the history backfill and for
    /// live messages from other connections, in relay order.
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
        self.connected.load(Ordering::SeqCst)
    }

    /// Dial the relay, authenticate and join the conversation.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let url = ws_url(&self.server_url);
        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let connect_frame = ClientFrame::Connect(ConnectPayload {
            auth: AuthPayload {
                token: self.token.clone(),
            },
            origin: Some(self.origin.clone()),
        });
        write
            .send(WsMessage::Text(encode(&connect_frame)?))
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let join_frame = ClientFrame::Join(Some(self.conversation_id.clone()));
        write
            .send(WsMessage::Text(encode(&join_frame)?))
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        self.connected.store(true, Ordering::SeqCst);

        self.writer = Some(tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        }));

        let subscribers = self.subscribers.clone();
        let own_origin = self.origin.clone();
        let connected = Arc::clone(&self.connected);
        self.reader = Some(tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        handle_server_frame(&text, &subscribers, &own_origin)
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            connected.store(false, Ordering::SeqCst);
            clog!("relay stream ended");
        }));

        self.outbound = Some(outbound);
        clog!("relay transport connected to {url}");
        Ok(())
    }

    /// Queue a message for the relay. When not connected the message is
    /// logged and dropped; the caller's local echo already happened.
    pub fn send(&self, envelope: &Envelope) {
        let outbound = match &self.outbound {
            Some(outbound) if self.is_connected() => outbound,
            _ => {
                clog!(
                    "relay transport not connected, dropping {}",
                    msg_id(&envelope.id)
                );
                return;
            }
        };
        let frame = ClientFrame::Message(SendPayload {
            conversation_id: Some(envelope.conversation_id.clone()),
            text: envelope.text.clone(),
            author_id: Some(envelope.author_id.clone()),
        });
        match encode(&frame) {
            Ok(body) => {
                if outbound.send(WsMessage::Text(body)).is_err() {
                    clog!("relay writer gone, dropping {}", msg_id(&envelope.id));
                }
            }
            Err(err) => clog!("failed to encode outbound frame: {err}"),
        }
    }

    /// Tear the connection down. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn handle_server_frame(text: &str, subscribers: &Subscribers<Envelope>, own_origin: &str) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            clog!("unparseable relay frame: {err}");
            return;
        }
    };
    match frame {
        ServerFrame::History(messages) => {
            for message in &messages {
                subscribers.publish(message);
            }
        }
        ServerFrame::Message(mut message) => {
            // Our own send coming back; it was already echoed locally.
            if message.origin.as_deref() == Some(own_origin) {
                return;
            }
            message.origin = None;
            subscribers.publish(&message);
        }
        ServerFrame::Error(payload) => {
            clog!("relay error: {}", payload.message);
        }
    }
}

fn encode(frame: &ClientFrame) -> Result<String, TransportError> {
    serde_json::to_string(frame).map_err(|err| TransportError::Protocol(err.to_string()))
}

/// Rewrite the configured http(s) base url to the relay's ws(s) endpoint.
fn ws_url(server_url: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let rewritten = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{base}")
    };
    format!("{rewritten}/ws")
}

/// Fetch a conversation's full history over plain HTTP.
pub fn fetch_messages(
    server_url: &str,
    conversation_id: &str,
) -> Result<Vec<Envelope>, TransportError> {
    let url = format!(
        "{}/conversations/{}/messages",
        server_url.trim_end_matches('/'),
        conversation_id
    );
    let response = ureq::get(&url)
        .call()
        .map_err(|err| TransportError::Http(err.to_string()))?;
    response
        .into_json()
        .map_err(|err| TransportError::Protocol(err.to_string()))
}

/// Post a message over plain HTTP. The relay mints id and timestamp and
/// returns the stored envelope.
pub fn post_message(
    server_url: &str,
    conversation_id: &str,
    token: Option<&str>,
    text: &str,
) -> Result<Envelope, TransportError> {
    let url = format!(
        "{}/conversations/{}/messages",
        server_url.trim_end_matches('/'),
        conversation_id
    );
    let mut request = ureq::post(&url);
    if let Some(token) = token {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }
    let response = request
        .send_json(serde_json::json!({ "text": text }))
        .map_err(|err| match err {
            ureq::Error::Status(code, response) => {
                let body = response.into_string().unwrap_or_default();
                TransportError::Http(format!("status {code}: {body}"))
            }
            other => TransportError::Http(other.to_string()),
        })?;
    response
        .into_json()
        .map_err(|err| TransportError::Protocol(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_requires_a_server_url() {
        assert!(matches!(
            RelayTransport::new(None, "default", None),
            Err(TransportError::MissingServerUrl)
        ));
        assert!(matches!(
            RelayTransport::new(Some("   "), "default", None),
            Err(TransportError::MissingServerUrl)
        ));
        assert!(RelayTransport::new(Some("http://localhost:3000"), "default", None).is_ok());
    }

    #[test]
    fn send_before_connect_drops_without_panicking() {
        let transport =
            RelayTransport::new(Some("http://localhost:3000"), "default", None).unwrap();
        transport.send(&Envelope::new("default", "alice", "hola"));
        assert!(!transport.is_connected());
    }

    #[test]
    fn ws_url_rewrites_schemes() {
        assert_eq!(ws_url("http://localhost:3000"), "ws://localhost:3000/ws");
        assert_eq!(ws_url("https://chat.example.com/"), "wss://chat.example.com/ws");
        assert_eq!(ws_url("ws://localhost:3000"), "ws://localhost:3000/ws");
        assert_eq!(ws_url("localhost:3000"), "ws://localhost:3000/ws");
    }

    #[test]
    fn own_origin_broadcasts_are_dropped() {
        let subscribers: Subscribers<Envelope> = Subscribers::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        let counter = std::sync::Arc::clone(&seen);
        subscribers.subscribe(move |_| *counter.lock().unwrap() += 1);

        let mut own = Envelope::new("default", "alice", "mine");
        own.origin = Some("conn-a".into());
        let frame = serde_json::to_string(&ServerFrame::Message(own)).unwrap();
        handle_server_frame(&frame, &subscribers, "conn-a");
        assert_eq!(*seen.lock().unwrap(), 0);

        let mut other = Envelope::new("default", "bob", "theirs");
        other.origin = Some("conn-b".into());
        let frame = serde_json::to_string(&ServerFrame::Message(other)).unwrap();
        handle_server_frame(&frame, &subscribers, "conn-a");
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
