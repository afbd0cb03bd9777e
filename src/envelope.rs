//! The message envelope: the one JSON shape exchanged by the client API,
//! the persisted history, the realtime wire and the relay server's log.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Room key used when a caller does not name a conversation.
pub const DEFAULT_CONVERSATION_ID: &str = "default";

/// Author sentinel for unauthenticated senders.
pub const ANONYMOUS_AUTHOR_ID: &str = "anonymous";

/// Delivery status values. The client send path tags outgoing messages as
/// `sent`; server-built envelopes carry no status at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
}

/// A single chat message.
///
/// `id` and `timestamp` are assigned exactly once, by whichever side
/// constructs the envelope, and are never rewritten downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub text: String,
    /// RFC 3339 UTC instant.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
    /// Connection tag carried only on live relay broadcasts so the
    /// originating client can drop its own echo. Never persisted and never
    /// present on HTTP responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Envelope {
    /// Build a fresh envelope with a generated id and timestamp.
    pub fn new(
        conversation_id: impl Into<String>,
        author_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: new_message_id(),
            conversation_id: conversation_id.into(),
            author_id: author_id.into(),
            text: text.into(),
            timestamp: now_timestamp(),
            status: None,
            origin: None,
        }
    }

    /// Tag the envelope with a delivery status.
    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 6;

/// Generate a fresh message id: unix-epoch milliseconds in base 36, a `-`
/// separator, then six random base-36 characters, e.g. `mfx1k2o3-a1b2c3`.
pub fn new_message_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{}", to_base36(millis), suffix)
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 digits are ASCII")
}

/// Current UTC instant as an RFC 3339 string.
pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("RFC 3339 formatting of a UTC instant")
}
