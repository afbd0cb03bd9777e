//! Wire frames spoken over the relay WebSocket.
//!
//! Every frame is a JSON object `{"type": ..., "payload": ...}`. Clients
//! send [`ClientFrame`]s, the relay answers with [`ServerFrame`]s. The
//! first client frame on a connection must be `connect`; everything before
//! a successful handshake is rejected.

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Frames sent by a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Handshake, carrying the bearer token and the connection's echo tag.
    Connect(ConnectPayload),
    /// Enter a conversation; `None` means the default conversation.
    Join(Option<String>),
    /// Submit a message for relay-side minting and fan-out.
    Message(SendPayload),
}

/// Frames sent by the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    /// One-time backfill of every message already in the joined conversation.
    History(Vec<Envelope>),
    /// A live message in a conversation the client has joined.
    Message(Envelope),
    /// Authentication or protocol failure; the relay closes after sending it.
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectPayload {
    #[serde(default)]
    pub auth: AuthPayload,
    /// Opaque per-connection tag the relay copies onto this connection's
    /// own live broadcasts so the sender can recognise them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_frame_wire_shape() {
        let frame = ClientFrame::Connect(ConnectPayload {
            auth: AuthPayload {
                token: Some("abc.def".into()),
            },
            origin: Some("conn-1".into()),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "connect",
                "payload": {"auth": {"token": "abc.def"}, "origin": "conn-1"}
            })
        );
    }

    #[test]
    fn connect_frame_tolerates_empty_payload() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "connect", "payload": {}})).unwrap();
        match frame {
            ClientFrame::Connect(payload) => {
                assert!(payload.auth.token.is_none());
                assert!(payload.origin.is_none());
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn join_frame_carries_optional_conversation() {
        let named = serde_json::to_value(ClientFrame::Join(Some("standup".into()))).unwrap();
        assert_eq!(named, json!({"type": "join", "payload": "standup"}));

        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "join", "payload": null})).unwrap();
        assert!(matches!(frame, ClientFrame::Join(None)));
    }

    #[test]
    fn message_frame_uses_camel_case_keys() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "message",
            "payload": {"conversationId": "standup", "text": "hola", "authorId": "alice"}
        }))
        .unwrap();
        match frame {
            ClientFrame::Message(payload) => {
                assert_eq!(payload.conversation_id.as_deref(), Some("standup"));
                assert_eq!(payload.text, "hola");
                assert_eq!(payload.author_id.as_deref(), Some("alice"));
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn error_frame_wire_shape() {
        let frame = ServerFrame::Error(ErrorPayload {
            message: "invalid token".into(),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "payload": {"message": "invalid token"}})
        );
    }
}
