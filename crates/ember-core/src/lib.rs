//! # Ember Core
//!
//! The core engine of the Ember Phoenix Channels client.
//!
//! One [`Socket`] owns one WebSocket-shaped [`Transport`] and multiplexes
//! any number of [`Channel`]s over it, each an independently joined
//! conversation on a named topic. Outbound messages are [`Push`]es carrying
//! status-keyed reply hooks; inbound frames are decoded by a [`Serializer`]
//! and fanned out to the channels that claim them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  frames   ┌────────┐  topic fan-out  ┌─────────┐
//! │ Transport│──────────▶│ Socket │────────────────▶│ Channel │──▶ bindings
//! │ (injected)│◀──────────│        │◀────────────────│         │◀── pushes
//! └──────────┘   sends   └────────┘     pushes      └─────────┘
//! ```
//!
//! The transport and the payload codec are injected capabilities; the
//! shipped implementations live in `ember-transport` and [`JsonCodec`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_core::Socket;
//! use serde_json::json;
//!
//! let socket = Socket::builder("wss://example.com/socket")
//!     .transport(my_factory)
//!     .build();
//! socket.connect();
//!
//! let room = socket.channel("room:lobby", json!({}));
//! room.join(None)
//!     .receive("ok", |_| println!("joined"))
//!     .receive("error", |msg| println!("refused: {:?}", msg.payload_value()));
//!
//! room.on("new_msg", |msg| println!("{}", msg.payload_value()));
//! room.push("new_msg", json!({"body": "hi"}), None);
//! ```

pub mod channel;
pub mod codec;
pub mod error;
pub mod message;
pub mod push;
pub mod registry;
pub mod serializer;
pub mod socket;
pub mod timer;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{Channel, ChannelState};
pub use codec::{JsonCodec, PayloadCodec};
pub use error::{
    SerializerError, SerializerResult, SocketError, TransportError, TransportResult,
};
pub use message::{Message, PHOENIX_TOPIC, events};
pub use push::{Push, TIMEOUT_STATUS};
pub use registry::SyncList;
pub use serializer::{Serializer, V2Serializer, VSN};
pub use socket::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_TIMEOUT, Socket, SocketBuilder};
pub use timer::{HeartbeatTimer, TimeoutTimer, reconnect_after, rejoin_after};
pub use transport::{ReadyState, Transport, TransportDelegate, TransportFactory, close_code};
