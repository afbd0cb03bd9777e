//! The relay server: HTTP endpoints plus the WebSocket fan-out loop.
//!
//! State is in memory only. Each conversation has an append-only message
//! log and a broadcast channel; the log mutex is held across every append
//! and broadcast, and across the join snapshot, so per-room delivery order
//! always matches append order and a joining connection sees every message
//! exactly once across backfill and live feed. Lock order is log first,
//! then rooms.
//!
//! Live broadcasts go to every member of the room, the sender's own
//! connection included; the sender's copy carries the origin tag from its
//! `connect` handshake so the client can recognise it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::auth::{verify_token, DEFAULT_SHARED_SECRET};
use crate::clog;
use crate::envelope::{Envelope, ANONYMOUS_AUTHOR_ID, DEFAULT_CONVERSATION_ID};
use crate::logging::{author_id, conv_id, msg_id};
use crate::protocol::{ClientFrame, ErrorPayload, ServerFrame};

/// Buffered live messages per room before a slow connection starts lagging.
const ROOM_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Secret the bearer tokens are signed with.
    pub shared_secret: String,
    /// Accept unauthenticated connections and posts.
    pub no_auth: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            shared_secret: DEFAULT_SHARED_SECRET.to_string(),
            no_auth: false,
        }
    }
}

/// Room-keyed append-only message store, injected into [`RelayState`] so a
/// durable implementation can replace it without touching handler logic.
#[derive(Default)]
pub struct ConversationLog {
    conversations: HashMap<String, Vec<Envelope>>,
}

impl ConversationLog {
    pub fn new() -> Self {
        let mut log = Self::default();
        log.conversations
            .insert(DEFAULT_CONVERSATION_ID.to_string(), Vec::new());
        log
    }

    fn append(&mut self, envelope: Envelope) {
        self.conversations
            .entry(envelope.conversation_id.clone())
            .or_default()
            .push(envelope);
    }

    /// Unknown conversations read as empty, same as known-but-quiet ones.
    fn history(&self, conversation_id: &str) -> Vec<Envelope> {
        self.conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct RelayState {
    config: RelayConfig,
    log: Arc<Mutex<ConversationLog>>,
    rooms: Arc<RwLock<HashMap<String, broadcast::Sender<Envelope>>>>,
    connections: Arc<AtomicUsize>,
    next_conn: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new(config: RelayConfig, log: ConversationLog) -> Self {
        Self {
            config,
            log: Arc::new(Mutex::new(log)),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            next_conn: Arc::new(AtomicU64::new(0)),
        }
    }

    fn room_sender(&self, conversation_id: &str) -> broadcast::Sender<Envelope> {
        {
            let rooms = self.rooms.read().expect("room map poisoned");
            if let Some(sender) = rooms.get(conversation_id) {
                return sender.clone();
            }
        }
        let mut rooms = self.rooms.write().expect("room map poisoned");
        rooms
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Mint, append and broadcast a message. The broadcast copy carries
    /// `origin`; the stored and returned copy never does.
    fn ingest(
        &self,
        conversation_id: &str,
        author: &str,
        text: &str,
        origin: Option<&str>,
    ) -> Envelope {
        let envelope = Envelope::new(conversation_id, author, text);
        let mut log = self.log.lock().expect("conversation log poisoned");
        log.append(envelope.clone());
        let mut live = envelope.clone();
        live.origin = origin.map(str::to_string);
        // No receivers is fine; the message is already in the log.
        let _ = self.room_sender(conversation_id).send(live);
        drop(log);
        envelope
    }

    /// History snapshot plus a live subscription, taken under one lock
    /// acquisition so backfill and feed neither overlap nor leave a gap.
    fn join(&self, conversation_id: &str) -> (Vec<Envelope>, broadcast::Receiver<Envelope>) {
        let log = self.log.lock().expect("conversation log poisoned");
        let receiver = self.room_sender(conversation_id).subscribe();
        let history = log.history(conversation_id);
        (history, receiver)
    }

    fn history(&self, conversation_id: &str) -> Vec<Envelope> {
        self.log
            .lock()
            .expect("conversation log poisoned")
            .history(conversation_id)
    }
}

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/conversations/:conversation_id/messages",
            get(get_messages).post(post_message),
        )
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn get_messages(
    State(state): State<RelayState>,
    Path(conversation_id): Path<String>,
) -> Response {
    Json(state.history(&conversation_id)).into_response()
}

#[derive(Deserialize)]
struct PostMessageBody {
    #[serde(default)]
    text: String,
}

async fn post_message(
    State(state): State<RelayState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<PostMessageBody>>,
) -> Response {
    let text = body.map(|Json(body)| body.text).unwrap_or_default();
    if text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "text required"})),
        )
            .into_response();
    }

    let claims = bearer_token(&headers)
        .and_then(|token| verify_token(&state.config.shared_secret, token));
    if claims.is_none() && !state.config.no_auth {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response();
    }
    let author = claims
        .as_ref()
        .and_then(|claims| claims.subject())
        .unwrap_or(ANONYMOUS_AUTHOR_ID)
        .to_string();

    let envelope = state.ingest(&conversation_id, &author, &text, None);
    clog!(
        "posted {} from {} to {}",
        msg_id(&envelope.id),
        author_id(&author),
        conv_id(&conversation_id)
    );
    (StatusCode::CREATED, Json(envelope)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// What the `connect` handshake established for one connection.
struct Session {
    principal: Option<String>,
    origin: Option<String>,
}

async fn handle_socket(mut socket: WebSocket, state: RelayState) {
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
    let active = state.connections.fetch_add(1, Ordering::Relaxed) + 1;
    clog!("ws connection {conn} open ({active} active)");

    if let Some(session) = handshake(&mut socket, &state, conn).await {
        run_session(socket, &state, session, conn).await;
    }

    let active = state.connections.fetch_sub(1, Ordering::Relaxed) - 1;
    clog!("ws connection {conn} closed ({active} active)");
}

/// Wait for the mandatory `connect` frame. Anything else ends the
/// connection with an error frame; an invalid or missing token does too
/// unless the relay runs with auth disabled.
async fn handshake(socket: &mut WebSocket, state: &RelayState, conn: u64) -> Option<Session> {
    loop {
        let message = socket.recv().await?.ok()?;
        match message {
            Message::Text(text) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        clog!("ws connection {conn}: unparseable handshake frame: {err}");
                        reject(socket, "malformed frame").await;
                        return None;
                    }
                };
                let ClientFrame::Connect(payload) = frame else {
                    clog!("ws connection {conn}: frame before connect, closing");
                    reject(socket, "connect required").await;
                    return None;
                };

                let claims = payload
                    .auth
                    .token
                    .as_deref()
                    .and_then(|token| verify_token(&state.config.shared_secret, token));
                if claims.is_none() && !state.config.no_auth {
                    clog!("ws connection {conn}: invalid token, closing");
                    reject(socket, "invalid token").await;
                    return None;
                }
                let principal =
                    claims.and_then(|claims| claims.subject().map(str::to_string));
                if let Some(principal) = &principal {
                    clog!("ws connection {conn} authenticated as {}", author_id(principal));
                }
                return Some(Session {
                    principal,
                    origin: payload.origin,
                });
            }
            Message::Ping(payload) => {
                let _ = socket.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

async fn reject(socket: &mut WebSocket, message: &str) {
    let frame = ServerFrame::Error(ErrorPayload {
        message: message.to_string(),
    });
    if let Ok(body) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(body)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn run_session(mut socket: WebSocket, state: &RelayState, session: Session, conn: u64) {
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let mut joined: HashSet<String> = HashSet::new();
    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            Some(frame) = conn_rx.recv() => {
                match serde_json::to_string(&frame) {
                    Ok(body) => {
                        if socket.send(Message::Text(body)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => clog!("ws connection {conn}: failed to encode frame: {err}"),
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(text) => {
                        let frame: ClientFrame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                clog!("ws connection {conn}: unparseable frame: {err}");
                                continue;
                            }
                        };
                        match frame {
                            ClientFrame::Connect(_) => {
                                // Already past the handshake; repeats are noise.
                            }
                            ClientFrame::Join(conversation) => {
                                let conversation_id = conversation
                                    .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_string());
                                let (history, receiver) = state.join(&conversation_id);
                                clog!(
                                    "ws connection {conn} joined {} ({} backfilled)",
                                    conv_id(&conversation_id),
                                    history.len()
                                );
                                // History goes through the same queue as live
                                // frames, ahead of anything the forwarder adds.
                                if conn_tx.send(ServerFrame::History(history)).is_err() {
                                    break;
                                }
                                if joined.insert(conversation_id) {
                                    forwarders.push(spawn_forwarder(receiver, conn_tx.clone(), conn));
                                }
                            }
                            ClientFrame::Message(payload) => {
                                if payload.text.trim().is_empty() {
                                    clog!("ws connection {conn}: ignoring message with blank text");
                                    continue;
                                }
                                let conversation_id = payload
                                    .conversation_id
                                    .as_deref()
                                    .unwrap_or(DEFAULT_CONVERSATION_ID);
                                let author = session
                                    .principal
                                    .as_deref()
                                    .or(payload.author_id.as_deref())
                                    .unwrap_or(ANONYMOUS_AUTHOR_ID);
                                let envelope = state.ingest(
                                    conversation_id,
                                    author,
                                    &payload.text,
                                    session.origin.as_deref(),
                                );
                                clog!(
                                    "ws connection {conn}: {} from {} in {}",
                                    msg_id(&envelope.id),
                                    author_id(author),
                                    conv_id(conversation_id)
                                );
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    for forwarder in forwarders {
        forwarder.abort();
    }
}

fn spawn_forwarder(
    mut receiver: broadcast::Receiver<Envelope>,
    conn_tx: mpsc::UnboundedSender<ServerFrame>,
    conn: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    if conn_tx.send(ServerFrame::Message(envelope)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    clog!("ws connection {conn} lagged, skipped {skipped} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn unknown_conversations_read_empty() {
        let log = ConversationLog::new();
        assert!(log.history("default").is_empty());
        assert!(log.history("never-seen").is_empty());
    }

    #[test]
    fn ingest_returns_the_stored_envelope_without_origin() {
        let state = RelayState::new(RelayConfig::default(), ConversationLog::new());
        let envelope = state.ingest("default", "alice", "hola", Some("conn-1"));
        assert!(envelope.origin.is_none());
        assert_eq!(state.history("default"), vec![envelope]);
    }

    #[tokio::test]
    async fn join_backfill_and_live_feed_do_not_overlap() {
        let state = RelayState::new(RelayConfig::default(), ConversationLog::new());
        state.ingest("default", "alice", "before", None);

        let (history, mut receiver) = state.join("default");
        assert_eq!(history.len(), 1);

        state.ingest("default", "alice", "after", Some("conn-1"));
        let live = receiver.recv().await.unwrap();
        assert_eq!(live.text, "after");
        assert_eq!(live.origin.as_deref(), Some("conn-1"));
        assert!(matches!(
            receiver.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
