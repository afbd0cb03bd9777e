//! Transport-selecting chat client.
//!
//! [`ChatClient`] is the front door: configure it with [`ClientConfig`],
//! initialise, connect, send. The transport behind it is a closed set,
//! local or relay, picked by [`choose_transport`]; when the relay is
//! preferred but cannot even be constructed the client logs the reason and
//! falls back to local rather than failing initialisation.
//!
//! Every sent message is echoed to the client's own subscribers exactly
//! once, no matter which transport carried it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::bus::LocalBus;
use crate::clog;
use crate::envelope::{
    DeliveryStatus, Envelope, ANONYMOUS_AUTHOR_ID, DEFAULT_CONVERSATION_ID,
};
use crate::events::{SubscriptionId, Subscribers};
use crate::local::LocalTransport;
use crate::logging::conv_id;
use crate::relay_transport::{RelayTransport, TransportError};
use crate::storage::HistoryStore;

/// Ids of recent sends kept for echo absorption.
const RECENT_SEND_LIMIT: usize = 256;

/// What the caller asked for. `Auto` means relay when a server url is
/// configured, local otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportPreference {
    #[default]
    Local,
    Relay,
    Auto,
}

impl TransportPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportPreference::Local => "local",
            TransportPreference::Relay => "relay",
            TransportPreference::Auto => "auto",
        }
    }
}

impl std::str::FromStr for TransportPreference {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(TransportPreference::Local),
            "relay" => Ok(TransportPreference::Relay),
            "auto" => Ok(TransportPreference::Auto),
            other => Err(format!(
                "unknown transport {other:?} (expected local, relay or auto)"
            )),
        }
    }
}

/// What actually got selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Local,
    Relay,
}

/// Resolve a preference against the available configuration.
pub fn choose_transport(
    preference: TransportPreference,
    server_url: Option<&str>,
) -> TransportKind {
    let has_url = server_url.map(|url| !url.trim().is_empty()).unwrap_or(false);
    match preference {
        TransportPreference::Local => TransportKind::Local,
        TransportPreference::Relay => TransportKind::Relay,
        TransportPreference::Auto if has_url => TransportKind::Relay,
        TransportPreference::Auto => TransportKind::Local,
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportPreference,
    pub conversation_id: String,
    pub author_id: Option<String>,
    pub server_url: Option<String>,
    pub token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportPreference::default(),
            conversation_id: DEFAULT_CONVERSATION_ID.to_string(),
            author_id: None,
            server_url: None,
            token: None,
        }
    }
}

#[derive(Debug)]
pub enum ClientError {
    /// Messages must carry non-blank text.
    EmptyText,
    /// The client has not been initialised with a transport yet.
    NotInitialized,
    Transport(TransportError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::EmptyText => write!(f, "message text must not be empty"),
            ClientError::NotInitialized => write!(f, "client is not initialised"),
            ClientError::Transport(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        ClientError::Transport(err)
    }
}

/// The closed set of transports a client can run on.
pub enum Transport {
    Local(LocalTransport),
    Relay(RelayTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Local(_) => TransportKind::Local,
            Transport::Relay(_) => TransportKind::Relay,
        }
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        match self {
            Transport::Local(transport) => {
                transport.connect();
                Ok(())
            }
            Transport::Relay(transport) => transport.connect().await,
        }
    }

    pub fn disconnect(&mut self) {
        match self {
            Transport::Local(transport) => transport.disconnect(),
            Transport::Relay(transport) => transport.disconnect(),
        }
    }

    pub fn send(&self, envelope: &Envelope) {
        match self {
            Transport::Local(transport) => transport.send(envelope),
            Transport::Relay(transport) => transport.send(envelope),
        }
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> SubscriptionId {
        match self {
            Transport::Local(transport) => transport.subscribe(callback),
            Transport::Relay(transport) => transport.subscribe(callback),
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self {
            Transport::Local(transport) => transport.unsubscribe(id),
            Transport::Relay(transport) => transport.unsubscribe(id),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Transport::Local(transport) => transport.is_connected(),
            Transport::Relay(transport) => transport.is_connected(),
        }
    }
}

pub struct ChatClient {
    store: HistoryStore,
    bus: LocalBus,
    config: ClientConfig,
    transport: Option<Transport>,
    listener: Option<SubscriptionId>,
    events: Subscribers<Envelope>,
    recent_sends: Arc<Mutex<VecDeque<String>>>,
}

impl ChatClient {
    pub fn new(store: HistoryStore, bus: LocalBus) -> Self {
        Self {
            store,
            bus,
            config: ClientConfig::default(),
            transport: None,
            listener: None,
            events: Subscribers::new(),
            recent_sends: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Apply configuration and stand up the selected transport. Calling
    /// init on an already initialised client tears the old transport down
    /// first; subscribers registered with [`ChatClient::on_message`]
    /// survive the swap.
    pub fn init(&mut self, config: ClientConfig) {
        self.teardown();
        self.config = config;

        let kind = choose_transport(self.config.transport, self.config.server_url.as_deref());
        let transport = match kind {
            TransportKind::Relay => match RelayTransport::new(
                self.config.server_url.as_deref(),
                self.config.conversation_id.clone(),
                self.config.token.clone(),
            ) {
                Ok(relay) => Transport::Relay(relay),
                Err(err) => {
                    clog!("relay transport unavailable ({err}), falling back to local");
                    Transport::Local(self.local_transport())
                }
            },
            TransportKind::Local => Transport::Local(self.local_transport()),
        };

        let events = self.events.clone();
        let recent = Arc::clone(&self.recent_sends);
        self.listener = Some(transport.subscribe(move |message: &Envelope| {
            // The transport plays our own send back exactly once; the
            // optimistic echo already covered it.
            if absorb_recent(&recent, &message.id) {
                return;
            }
            events.publish(message);
        }));
        clog!(
            "client initialised: {} transport, conversation {}",
            match transport.kind() {
                TransportKind::Local => "local",
                TransportKind::Relay => "relay",
            },
            conv_id(&self.config.conversation_id)
        );
        self.transport = Some(transport);
    }

    fn local_transport(&self) -> LocalTransport {
        LocalTransport::new(
            self.config.conversation_id.clone(),
            self.store.clone(),
            self.bus.clone(),
        )
    }

    fn teardown(&mut self) {
        if let Some(mut old) = self.transport.take() {
            if let Some(listener) = self.listener.take() {
                old.unsubscribe(listener);
            }
            old.disconnect();
        }
    }

    /// Register a callback for every message this client observes: history
    /// replay, own sends and live traffic.
    pub fn on_message(
        &self,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Go live on the selected transport. Ignored until initialised.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let Some(transport) = &mut self.transport else {
            clog!("connect before init, ignoring");
            return Ok(());
        };
        transport.connect().await.map_err(ClientError::from)
    }

    /// Leave the live feed. The client stays initialised and can reconnect.
    /// Ignored until initialised.
    pub fn disconnect(&mut self) {
        if let Some(transport) = &mut self.transport {
            transport.disconnect();
        } else {
            clog!("disconnect before init, ignoring");
        }
    }

    /// Build, dispatch and echo a message. Returns the envelope as sent.
    ///
    /// The conversation defaults to the configured one, the author to the
    /// configured author or `anonymous`. Fails on blank text or when not
    /// initialised; transports themselves never fail a send.
    pub fn send_message(
        &self,
        text: &str,
        conversation_override: Option<&str>,
    ) -> Result<Envelope, ClientError> {
        if text.trim().is_empty() {
            return Err(ClientError::EmptyText);
        }
        let Some(transport) = &self.transport else {
            return Err(ClientError::NotInitialized);
        };

        let conversation_id = conversation_override.unwrap_or(&self.config.conversation_id);
        let author_id = self
            .config
            .author_id
            .clone()
            .unwrap_or_else(|| ANONYMOUS_AUTHOR_ID.to_string());
        let envelope =
            Envelope::new(conversation_id, author_id, text).with_status(DeliveryStatus::Sent);

        record_recent(&self.recent_sends, &envelope.id);
        transport.send(&envelope);
        self.events.publish(&envelope);
        Ok(envelope)
    }

    pub fn is_initialized(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .map(Transport::is_connected)
            .unwrap_or(false)
    }

    /// Which transport init actually selected, once initialised.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.transport.as_ref().map(Transport::kind)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

fn record_recent(recent: &Mutex<VecDeque<String>>, id: &str) {
    let mut recent = recent.lock().expect("recent send list poisoned");
    if recent.len() == RECENT_SEND_LIMIT {
        recent.pop_front();
    }
    recent.push_back(id.to_string());
}

fn absorb_recent(recent: &Mutex<VecDeque<String>>, id: &str) -> bool {
    let mut recent = recent.lock().expect("recent send list poisoned");
    if let Some(index) = recent.iter().position(|entry| entry == id) {
        recent.remove(index);
        true
    } else {
        false
    }
}
