//! Unified error types for the Ember core.
//!
//! Serializer errors cover the wire-format boundary; transport errors cover
//! the connection boundary. Contract violations by the caller (joining a
//! channel twice, pushing before join, oversized binary meta fields) are
//! panics, not error values.

use thiserror::Error;

// =============================================================================
// Serializer Errors
// =============================================================================

/// Errors raised while encoding or decoding wire frames.
#[derive(Debug, Clone, Error)]
pub enum SerializerError {
    /// A text frame could not be interpreted as JSON.
    #[error("failed to parse text frame as JSON: {0}")]
    DataFromString(String),

    /// A binary frame section could not be read as UTF-8, or the frame was
    /// shorter than its length prefixes promised.
    #[error("failed to read string from binary frame: {0}")]
    StringFromData(String),

    /// A `phx_reply` payload was not an object with `response` and `status`.
    #[error("malformed reply payload: {0}")]
    InvalidReplyStructure(String),

    /// The leading kind byte of a binary frame was not push/reply/broadcast.
    #[error("unknown binary frame kind: {0}")]
    InvalidBinaryKind(u8),

    /// The decoded frame carried no topic.
    #[error("frame is missing a topic")]
    MissingTopic,

    /// The decoded frame carried no event.
    #[error("frame is missing an event")]
    MissingEvent,

    /// The frame payload could not be decoded.
    #[error("failed to decode payload: {0}")]
    PayloadDecode(String),
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors that can occur in transport operations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {url} - {reason}")]
    ConnectionFailed {
        /// The URL that failed to connect.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// The transport is not connected.
    #[error("transport is not connected")]
    NotConnected,

    /// Message send failed.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// The connection was closed.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Reason for closure.
        reason: String,
    },
}

// =============================================================================
// Socket Errors
// =============================================================================

/// Faults surfaced to the socket's `on_error` callbacks.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    /// The transport reported an error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An inbound frame failed to decode. The offending bytes are carried
    /// for diagnostics; the frame itself is discarded.
    #[error("failed to decode inbound frame: {source}")]
    Decode {
        /// The serializer failure.
        source: SerializerError,
        /// The raw frame that triggered it.
        bytes: Vec<u8>,
    },
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for serializer operations.
pub type SerializerResult<T> = Result<T, SerializerError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
