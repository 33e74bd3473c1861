//! Bi-directional codec for the versioned wire format.
//!
//! Text frames are the 5-element JSON array
//! `[join_ref, ref, topic, event, payload]`. Binary frames carry a 1-byte
//! kind followed by single-byte length prefixes for the meta fields, then
//! the opaque payload. The client only ever *sends* push-kind binary
//! frames; it may *receive* any of the three kinds.

use serde_json::Value;

use crate::error::{SerializerError, SerializerResult};
use crate::message::{Message, events};

/// Wire protocol version, appended to the connect URL as `?vsn=`.
pub const VSN: &str = "2.0.0";

/// Binary frame kinds.
mod kind {
    pub const PUSH: u8 = 0;
    pub const REPLY: u8 = 1;
    pub const BROADCAST: u8 = 2;
}

/// Codec between [`Message`] values and wire frames.
///
/// Replaceable on the socket for servers speaking a custom framing; the
/// shipped implementation is [`V2Serializer`].
pub trait Serializer: Send + Sync {
    /// Encodes a message as a text frame.
    fn encode(&self, message: &Message) -> SerializerResult<String>;

    /// Encodes a message as a binary push frame.
    ///
    /// # Panics
    ///
    /// Panics if `join_ref`, `topic` or `event` exceeds 255 UTF-8 bytes;
    /// the single-byte length prefixes cannot represent more, and an
    /// oversized field is a contract violation by the caller.
    fn binary_encode(&self, message: &Message) -> Vec<u8>;

    /// Decodes a text frame.
    fn decode(&self, text: &str) -> SerializerResult<Message>;

    /// Decodes a binary frame of any kind.
    fn binary_decode(&self, data: &[u8]) -> SerializerResult<Message>;

    /// Protocol version negotiated via the connect URL.
    fn vsn(&self) -> &str {
        VSN
    }
}

/// The v2 wire format shipped with the library.
#[derive(Debug, Default, Clone, Copy)]
pub struct V2Serializer;

impl V2Serializer {
    /// Creates a new serializer.
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for V2Serializer {
    fn encode(&self, message: &Message) -> SerializerResult<String> {
        let array = Value::Array(vec![
            opt_string(&message.join_ref),
            opt_string(&message.reference),
            Value::String(message.topic.clone()),
            Value::String(message.event.clone()),
            message.payload_value(),
        ]);
        serde_json::to_string(&array).map_err(|e| SerializerError::PayloadDecode(e.to_string()))
    }

    fn binary_encode(&self, message: &Message) -> Vec<u8> {
        let join_ref = message.join_ref.as_deref().unwrap_or("");
        let topic = &message.topic;
        let event = &message.event;

        let mut frame = Vec::with_capacity(4 + join_ref.len() + topic.len() + event.len() + message.payload.len());
        frame.push(kind::PUSH);
        frame.push(meta_len(join_ref, "join_ref"));
        frame.push(meta_len(topic, "topic"));
        frame.push(meta_len(event, "event"));
        frame.extend_from_slice(join_ref.as_bytes());
        frame.extend_from_slice(topic.as_bytes());
        frame.extend_from_slice(event.as_bytes());
        frame.extend_from_slice(&message.payload);
        frame
    }

    fn decode(&self, text: &str) -> SerializerResult<Message> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SerializerError::DataFromString(e.to_string()))?;
        let Value::Array(parts) = value else {
            return Err(SerializerError::DataFromString("frame is not a JSON array".into()));
        };
        if parts.len() != 5 {
            return Err(SerializerError::DataFromString(format!(
                "expected 5 frame elements, got {}",
                parts.len()
            )));
        }
        let mut parts = parts.into_iter();
        let join_ref = nullable_string(parts.next().unwrap_or(Value::Null));
        let reference = nullable_string(parts.next().unwrap_or(Value::Null));
        let topic = match parts.next() {
            Some(Value::String(s)) => s,
            _ => return Err(SerializerError::MissingTopic),
        };
        let event = match parts.next() {
            Some(Value::String(s)) => s,
            _ => return Err(SerializerError::MissingEvent),
        };
        let payload = parts.next().unwrap_or(Value::Null);

        if event == events::REPLY {
            let Value::Object(mut reply) = payload else {
                return Err(SerializerError::InvalidReplyStructure(
                    "reply payload is not an object".into(),
                ));
            };
            let response = reply
                .remove("response")
                .ok_or_else(|| SerializerError::InvalidReplyStructure("missing response".into()))?;
            let status = match reply.remove("status") {
                Some(Value::String(s)) => s,
                _ => {
                    return Err(SerializerError::InvalidReplyStructure(
                        "missing status".into(),
                    ));
                }
            };
            Ok(Message::reply(join_ref, reference, topic, status, payload_bytes(response)?))
        } else if join_ref.is_some() || reference.is_some() {
            Ok(Message::message(join_ref, reference, topic, event, payload_bytes(payload)?))
        } else {
            Ok(Message::broadcast(topic, event, payload_bytes(payload)?))
        }
    }

    fn binary_decode(&self, data: &[u8]) -> SerializerResult<Message> {
        let (&head, rest) = data
            .split_first()
            .ok_or_else(|| SerializerError::StringFromData("empty binary frame".into()))?;
        match head {
            kind::PUSH => {
                let mut frame = BinaryReader::new(rest, 3)?;
                let join_ref = frame.string()?;
                let topic = frame.required_string(SerializerError::MissingTopic)?;
                let event = frame.required_string(SerializerError::MissingEvent)?;
                Ok(Message::message(join_ref, None, topic, event, frame.payload()))
            }
            kind::REPLY => {
                let mut frame = BinaryReader::new(rest, 4)?;
                let join_ref = frame.string()?;
                let reference = frame.string()?;
                let topic = frame.required_string(SerializerError::MissingTopic)?;
                // The event slot of a binary reply carries the status.
                let status = frame.required_string(SerializerError::MissingEvent)?;
                Ok(Message::reply(join_ref, reference, topic, status, frame.payload()))
            }
            kind::BROADCAST => {
                let mut frame = BinaryReader::new(rest, 2)?;
                let topic = frame.required_string(SerializerError::MissingTopic)?;
                let event = frame.required_string(SerializerError::MissingEvent)?;
                Ok(Message::broadcast(topic, event, frame.payload()))
            }
            other => Err(SerializerError::InvalidBinaryKind(other)),
        }
    }
}

/// Reads length-prefixed UTF-8 meta fields off a binary frame body.
struct BinaryReader<'a> {
    lengths: &'a [u8],
    data: &'a [u8],
    index: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(body: &'a [u8], meta_fields: usize) -> SerializerResult<Self> {
        if body.len() < meta_fields {
            return Err(SerializerError::StringFromData(format!(
                "frame too short for {meta_fields} length prefixes"
            )));
        }
        let (lengths, data) = body.split_at(meta_fields);
        Ok(Self { lengths, data, index: 0 })
    }

    /// Next meta field; zero-length fields read as `None`.
    fn string(&mut self) -> SerializerResult<Option<String>> {
        let len = self.lengths[self.index] as usize;
        self.index += 1;
        if self.data.len() < len {
            return Err(SerializerError::StringFromData(
                "frame shorter than its length prefixes promise".into(),
            ));
        }
        let (field, rest) = self.data.split_at(len);
        self.data = rest;
        if field.is_empty() {
            return Ok(None);
        }
        std::str::from_utf8(field)
            .map(|s| Some(s.to_owned()))
            .map_err(|e| SerializerError::StringFromData(e.to_string()))
    }

    fn required_string(&mut self, missing: SerializerError) -> SerializerResult<String> {
        self.string()?.ok_or(missing)
    }

    /// Everything after the meta fields is the opaque payload.
    fn payload(self) -> Vec<u8> {
        self.data.to_vec()
    }
}

fn nullable_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}

fn opt_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

/// Encodes a decoded JSON payload as bytes, storing raw strings unquoted.
fn payload_bytes(value: Value) -> SerializerResult<Vec<u8>> {
    match value {
        Value::String(s) => Ok(s.into_bytes()),
        other => serde_json::to_vec(&other).map_err(|e| SerializerError::PayloadDecode(e.to_string())),
    }
}

fn meta_len(field: &str, name: &str) -> u8 {
    assert!(
        field.len() <= u8::MAX as usize,
        "binary frame {name} exceeds 255 bytes: {}",
        field.len()
    );
    field.len() as u8
}
