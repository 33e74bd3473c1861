//! The transport capability seam.
//!
//! The socket owns exactly one transport at a time and drives it through
//! the [`Transport`] trait; the transport reports back through the
//! [`TransportDelegate`] it was built with. Implementations do their I/O on
//! their own tasks and must not block inside delegate callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use crate::error::{TransportError, TransportResult};

/// WebSocket close codes the core inspects.
pub mod close_code {
    /// Clean, user-requested closure.
    pub const NORMAL: u16 = 1000;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
}

/// Observable connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Handshake in progress.
    Connecting,
    /// Frames can flow.
    Open,
    /// Close initiated, not yet acknowledged.
    Closing,
    /// No connection.
    Closed,
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One WebSocket-shaped connection, injected into the socket.
pub trait Transport: Send + Sync {
    /// Begins the connection handshake with the given headers.
    fn connect(&self, headers: &HashMap<String, String>);

    /// Closes the connection with a close code and optional reason.
    fn disconnect(&self, code: u16, reason: Option<&str>);

    /// Sends a text frame.
    fn send_text(&self, text: &str) -> TransportResult<()>;

    /// Sends a binary frame.
    fn send_binary(&self, data: &[u8]) -> TransportResult<()>;

    /// Current connection state.
    fn ready_state(&self) -> ReadyState;
}

/// Callbacks a transport delivers to its owner.
///
/// All callbacks are synchronous and run on the transport's event path.
pub trait TransportDelegate: Send + Sync {
    /// The connection is open; `response` carries handshake details if any.
    fn on_open(&self, response: Option<String>);

    /// The transport faulted. Does not imply the connection closed.
    fn on_error(&self, error: TransportError, response: Option<String>);

    /// A text frame arrived.
    fn on_message_text(&self, text: &str);

    /// A binary frame arrived.
    fn on_message_binary(&self, data: &[u8]);

    /// The connection closed.
    fn on_close(&self, code: u16, reason: Option<&str>);
}

/// Builds a fresh transport for each (re)connect attempt.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport bound to `url` that reports to `delegate`.
    fn build(&self, url: Url, delegate: Arc<dyn TransportDelegate>) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(Url, Arc<dyn TransportDelegate>) -> Arc<dyn Transport> + Send + Sync,
{
    fn build(&self, url: Url, delegate: Arc<dyn TransportDelegate>) -> Arc<dyn Transport> {
        self(url, delegate)
    }
}
