//! # Ember
//!
//! A Phoenix Channels client for Rust.
//!
//! One [`Socket`](ember_core::Socket) opens one WebSocket connection and
//! multiplexes any number of topic-scoped
//! [`Channel`](ember_core::Channel)s over it. Channels join asynchronously,
//! survive disconnects through per-channel rejoin backoff, and hand every
//! outbound message back as a [`Push`](ember_core::Push) whose reply hooks
//! are keyed by status (`"ok"`, `"error"`, `"timeout"`).
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use ember::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let socket = ember::socket("wss://example.com/socket").build();
//!     socket.connect();
//!
//!     let room = socket.channel("room:lobby", json!({}));
//!     room.on("new_msg", |msg| println!("{}", msg.payload_value()));
//!     room.join(None)
//!         .receive("ok", |_| println!("joined"))
//!         .receive("timeout", |_| println!("join timed out"));
//!
//!     room.push("new_msg", json!({"body": "hi"}), None);
//! }
//! ```
//!
//! The transport is an injected capability; `ember-transport` ships the
//! default tokio-tungstenite implementation that [`socket`] wires in.

// Core types
pub use ember_core::*;

// Shipped transport
pub use ember_transport;

/// Starts a socket builder wired to the shipped WebSocket transport.
///
/// Call [`SocketBuilder::build`](ember_core::SocketBuilder::build) after
/// setting any params, headers or timeouts.
pub fn socket(endpoint: impl Into<String>) -> ember_core::SocketBuilder {
    ember_core::Socket::builder(endpoint).transport(ember_transport::WebSocketTransport::factory())
}

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use ember::prelude::*;
/// ```
pub mod prelude {
    pub use ember_core::{Channel, ChannelState, Message, Push, Socket, SocketBuilder};
    pub use ember_core::{PayloadCodec, Serializer, Transport};
}
