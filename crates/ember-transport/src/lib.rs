//! WebSocket transport layer for the Ember Phoenix Channels client.
//!
//! The core treats the transport as an injected capability; this crate
//! ships the default one, built on tokio-tungstenite with TLS support.

pub mod websocket;

pub use websocket::WebSocketTransport;
