//! The immutable wire record exchanged with the server.

use serde_json::Value;

/// Reserved protocol events.
pub mod events {
    /// Sent by the client to join a topic.
    pub const JOIN: &str = "phx_join";
    /// Sent by the client to leave a topic.
    pub const LEAVE: &str = "phx_leave";
    /// Server acknowledgement of a pushed message.
    pub const REPLY: &str = "phx_reply";
    /// Server-side channel crash or transport-level error.
    pub const ERROR: &str = "phx_error";
    /// Server-side channel close.
    pub const CLOSE: &str = "phx_close";
    /// Liveness probe on the reserved `"phoenix"` topic.
    pub const HEARTBEAT: &str = "heartbeat";

    /// Returns true for events that drive the channel lifecycle.
    ///
    /// Lifecycle events from a previous join attempt must not leak into the
    /// current one, so membership checks treat these specially.
    pub fn is_lifecycle(event: &str) -> bool {
        matches!(event, JOIN | LEAVE | REPLY | ERROR | CLOSE)
    }
}

/// The topic the server reserves for heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// A single frame on the wire, after decoding.
///
/// `payload` holds the user data already encoded as bytes; the serializer
/// preserves raw strings as their UTF-8 bytes rather than re-quoting them.
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Ref of the `phx_join` that opened the channel this frame belongs to.
    pub join_ref: Option<String>,
    /// Ref correlating this frame with a reply.
    pub reference: Option<String>,
    /// Topic the frame is scoped to, e.g. `"room:lobby"`.
    pub topic: String,
    /// Event name, e.g. `"new_msg"` or one of [`events`].
    pub event: String,
    /// Encoded user payload.
    pub payload: Vec<u8>,
    /// Reply status (`"ok"`, `"error"`, `"timeout"`); replies only.
    pub status: Option<String>,
}

impl Message {
    /// A server reply (`phx_reply` envelope, unwrapped).
    pub fn reply(
        join_ref: Option<String>,
        reference: Option<String>,
        topic: impl Into<String>,
        status: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            join_ref,
            reference,
            topic: topic.into(),
            event: events::REPLY.into(),
            payload,
            status: Some(status.into()),
        }
    }

    /// A directed message carrying an arbitrary event.
    pub fn message(
        join_ref: Option<String>,
        reference: Option<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            join_ref,
            reference,
            topic: topic.into(),
            event: event.into(),
            payload,
            status: None,
        }
    }

    /// A server broadcast: no refs, fanned out to every subscriber of a topic.
    pub fn broadcast(topic: impl Into<String>, event: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            join_ref: None,
            reference: None,
            topic: topic.into(),
            event: event.into(),
            payload,
            status: None,
        }
    }

    /// The canonical empty payload.
    pub fn empty_payload() -> Vec<u8> {
        b"{}".to_vec()
    }

    /// Decodes the payload bytes into a JSON tree.
    ///
    /// Bytes that are not valid JSON are the raw form of a string payload
    /// and come back as [`Value::String`].
    pub fn payload_value(&self) -> Value {
        match serde_json::from_slice(&self.payload) {
            Ok(value) => value,
            Err(_) => Value::String(String::from_utf8_lossy(&self.payload).into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_events_are_flagged() {
        for event in [events::JOIN, events::LEAVE, events::REPLY, events::ERROR, events::CLOSE] {
            assert!(events::is_lifecycle(event));
        }
        assert!(!events::is_lifecycle("new_msg"));
        assert!(!events::is_lifecycle(events::HEARTBEAT));
    }

    #[test]
    fn reply_constructor_fills_event_and_status() {
        let msg = Message::reply(None, Some("1".into()), "room:lobby", "ok", Message::empty_payload());
        assert_eq!(msg.event, "phx_reply");
        assert_eq!(msg.status.as_deref(), Some("ok"));
    }

    #[test]
    fn string_payload_decodes_raw() {
        let msg = Message::broadcast("room:lobby", "new_msg", b"hello there".to_vec());
        assert_eq!(msg.payload_value(), Value::String("hello there".into()));
    }

    #[test]
    fn object_payload_decodes_as_json() {
        let msg = Message::broadcast("room:lobby", "new_msg", b"{\"body\":\"hi\"}".to_vec());
        assert_eq!(msg.payload_value(), serde_json::json!({"body": "hi"}));
    }
}
