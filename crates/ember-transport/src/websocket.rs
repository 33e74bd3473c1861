//! WebSocket transport implementation over tokio-tungstenite.
//!
//! The transport owns a spawned connection task: outbound frames arrive on
//! an mpsc command channel, inbound frames and lifecycle events go to the
//! socket's delegate, and a watch channel signals shutdown. Reconnect
//! policy lives in the socket, not here; when the link drops, this
//! transport reports the close and stops.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message as WsMessage, handshake::client::Request};
use tracing::{debug, info, trace, warn};
use url::Url;

use ember_core::{
    ReadyState, Transport, TransportDelegate, TransportError, TransportFactory, TransportResult,
    close_code,
};

enum Command {
    Text(String),
    Binary(Vec<u8>),
}

/// A [`Transport`] over a tokio-tungstenite WebSocket connection.
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    delegate: Arc<dyn TransportDelegate>,
    state: Mutex<ReadyState>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    shutdown_tx: watch::Sender<bool>,
    close_request: Mutex<Option<(u16, Option<String>)>>,
}

impl WebSocketTransport {
    /// Creates a transport bound to `url`, reporting to `delegate`.
    pub fn new(url: Url, delegate: Arc<dyn TransportDelegate>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                url,
                delegate,
                state: Mutex::new(ReadyState::Closed),
                command_tx: Mutex::new(None),
                shutdown_tx,
                close_request: Mutex::new(None),
            }),
        }
    }

    /// The factory the socket builder expects.
    pub fn factory() -> impl TransportFactory + 'static {
        |url: Url, delegate: Arc<dyn TransportDelegate>| {
            Arc::new(WebSocketTransport::new(url, delegate)) as Arc<dyn Transport>
        }
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, headers: &HashMap<String, String>) {
        {
            let mut state = self.inner.state.lock();
            if *state != ReadyState::Closed {
                debug!(state = %*state, "connect ignored; transport already active");
                return;
            }
            *state = ReadyState::Connecting;
        }
        let inner = Arc::clone(&self.inner);
        let headers = headers.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(run_connection(inner, headers, shutdown_rx));
    }

    fn disconnect(&self, code: u16, reason: Option<&str>) {
        {
            let mut state = self.inner.state.lock();
            if *state == ReadyState::Closed {
                return;
            }
            *state = ReadyState::Closing;
        }
        *self.inner.close_request.lock() = Some((code, reason.map(str::to_owned)));
        let _ = self.inner.shutdown_tx.send(true);
    }

    fn send_text(&self, text: &str) -> TransportResult<()> {
        self.send_command(Command::Text(text.to_owned()))
    }

    fn send_binary(&self, data: &[u8]) -> TransportResult<()> {
        self.send_command(Command::Binary(data.to_vec()))
    }

    fn ready_state(&self) -> ReadyState {
        *self.inner.state.lock()
    }
}

impl WebSocketTransport {
    fn send_command(&self, command: Command) -> TransportResult<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::NotConnected);
        }
        let guard = self.inner.command_tx.lock();
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(command)
            .map_err(|_| TransportError::SendFailed("connection task is gone".into()))
    }
}

impl Inner {
    fn set_state(&self, state: ReadyState) {
        *self.state.lock() = state;
    }

    fn take_close_request(&self) -> (u16, Option<String>) {
        self.close_request
            .lock()
            .take()
            .unwrap_or((close_code::NORMAL, None))
    }

    /// Marks the connection closed and tells the delegate once.
    fn finish(&self, code: u16, reason: Option<&str>) {
        self.set_state(ReadyState::Closed);
        *self.command_tx.lock() = None;
        self.delegate.on_close(code, reason);
    }
}

async fn run_connection(
    inner: Arc<Inner>,
    headers: HashMap<String, String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let request = match build_request(&inner.url, &headers) {
        Ok(request) => request,
        Err(e) => {
            inner.delegate.on_error(e, None);
            inner.finish(close_code::ABNORMAL, Some("invalid connect request"));
            return;
        }
    };

    info!(url = %inner.url, "connecting to WebSocket server");

    let connected = tokio::select! {
        _ = shutdown_rx.changed() => {
            let (code, reason) = inner.take_close_request();
            inner.finish(code, reason.as_deref());
            return;
        }
        connected = connect_async(request) => connected,
    };

    let (ws_stream, response) = match connected {
        Ok(ok) => ok,
        Err(e) => {
            warn!(url = %inner.url, error = %e, "WebSocket connection failed");
            inner.delegate.on_error(
                TransportError::ConnectionFailed {
                    url: inner.url.to_string(),
                    reason: e.to_string(),
                },
                None,
            );
            inner.finish(close_code::ABNORMAL, Some("connection failed"));
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    *inner.command_tx.lock() = Some(command_tx);
    inner.set_state(ReadyState::Open);

    info!(url = %inner.url, "WebSocket connected");
    inner.delegate.on_open(Some(response.status().to_string()));

    loop {
        tokio::select! {
            // User-requested close.
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let (code, reason) = inner.take_close_request();
                    let frame = CloseFrame {
                        code: code.into(),
                        reason: reason.clone().unwrap_or_default().into(),
                    };
                    let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
                    let _ = ws_tx.close().await;
                    inner.finish(code, reason.as_deref());
                    break;
                }
            }

            // Outbound frames.
            Some(command) = command_rx.recv() => {
                let (frame, kind) = match command {
                    Command::Text(text) => (WsMessage::Text(text.into()), "text"),
                    Command::Binary(data) => (WsMessage::Binary(data.into()), "binary"),
                };
                if let Err(e) = ws_tx.send(frame).await {
                    warn!(error = %e, kind, "failed to send frame");
                    inner.delegate.on_error(TransportError::SendFailed(e.to_string()), None);
                }
            }

            // Inbound frames.
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    trace!(len = text.len(), "received text frame");
                    inner.delegate.on_message_text(text.as_str());
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    trace!(len = data.len(), "received binary frame");
                    inner.delegate.on_message_binary(&data);
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = ws_tx.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    trace!("received pong");
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(frame = ?frame, "server closed connection");
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), Some(f.reason.to_string())))
                        .unwrap_or((close_code::ABNORMAL, None));
                    inner.finish(code, reason.as_deref());
                    break;
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    inner.delegate.on_error(TransportError::SendFailed(e.to_string()), None);
                    inner.finish(close_code::ABNORMAL, Some("websocket error"));
                    break;
                }
                None => {
                    info!("WebSocket stream ended");
                    inner.finish(close_code::ABNORMAL, Some("stream ended"));
                    break;
                }
            }
        }
    }
}

/// Builds the upgrade request, folding in the caller's headers.
fn build_request(url: &Url, headers: &HashMap<String, String>) -> Result<Request, TransportError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            TransportError::ConnectionFailed {
                url: url.to_string(),
                reason: format!("invalid header name '{name}': {e}"),
            }
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| TransportError::ConnectionFailed {
            url: url.to_string(),
            reason: format!("invalid header value for '{name:?}': {e}"),
        })?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDelegate;

    impl TransportDelegate for NullDelegate {
        fn on_open(&self, _response: Option<String>) {}
        fn on_error(&self, _error: TransportError, _response: Option<String>) {}
        fn on_message_text(&self, _text: &str) {}
        fn on_message_binary(&self, _data: &[u8]) {}
        fn on_close(&self, _code: u16, _reason: Option<&str>) {}
    }

    #[test]
    fn build_request_carries_extra_headers() {
        let url = Url::parse("ws://example.com/socket/websocket?vsn=2.0.0").unwrap();
        let mut headers = HashMap::new();
        headers.insert("authorization".to_owned(), "Bearer token".to_owned());

        let request = build_request(&url, &headers).unwrap();
        assert_eq!(request.headers()["authorization"], "Bearer token");
        assert_eq!(request.uri().to_string(), url.to_string());
    }

    #[test]
    fn build_request_rejects_bad_headers() {
        let url = Url::parse("ws://example.com/socket").unwrap();
        let mut headers = HashMap::new();
        headers.insert("bad\nname".to_owned(), "x".to_owned());
        assert!(build_request(&url, &headers).is_err());
    }

    #[tokio::test]
    async fn sends_fail_until_the_connection_is_open() {
        let url = Url::parse("ws://example.com/socket").unwrap();
        let transport = WebSocketTransport::new(url, Arc::new(NullDelegate));
        assert_eq!(transport.ready_state(), ReadyState::Closed);
        assert!(matches!(
            transport.send_text("hello"),
            Err(TransportError::NotConnected)
        ));
    }
}
