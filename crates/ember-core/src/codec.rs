//! The payload codec capability.

use serde_json::Value;

use crate::error::{SerializerError, SerializerResult};

/// Encodes and decodes user payloads at the API boundary.
///
/// The core only assumes round-trip faithfulness for JSON objects, arrays,
/// strings, numbers, bools and null.
pub trait PayloadCodec: Send + Sync {
    /// Encodes a JSON tree to payload bytes.
    fn encode(&self, value: &Value) -> SerializerResult<Vec<u8>>;

    /// Decodes payload bytes back to a JSON tree.
    fn decode(&self, bytes: &[u8]) -> SerializerResult<Value>;
}

/// The serde_json-backed codec shipped with the library.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Creates a new codec.
    pub fn new() -> Self {
        Self
    }
}

impl PayloadCodec for JsonCodec {
    fn encode(&self, value: &Value) -> SerializerResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| SerializerError::PayloadDecode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> SerializerResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError::PayloadDecode(e.to_string()))
    }
}
