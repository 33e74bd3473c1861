//! The socket engine: transport owner and channel multiplexer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::channel::{Channel, ChannelCore, ChannelState};
use crate::codec::{JsonCodec, PayloadCodec};
use crate::error::{SocketError, TransportError};
use crate::message::{Message, PHOENIX_TOPIC, events};
use crate::registry::SyncList;
use crate::serializer::{Serializer, V2Serializer};
use crate::timer::{HeartbeatTimer, TimeoutTimer, reconnect_after};
use crate::transport::{ReadyState, Transport, TransportDelegate, TransportFactory, close_code};

/// Default acknowledgement timeout for joins and pushes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type OpenCallback = Arc<dyn Fn() + Send + Sync>;
type CloseCallback = Arc<dyn Fn(u16, Option<&str>) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&SocketError) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Connect query parameters: fixed at construction, or recomputed on every
/// (re)connect for short-lived credentials.
enum ParamsSource {
    None,
    Static(serde_json::Map<String, Value>),
    Closure(Arc<dyn Fn() -> serde_json::Map<String, Value> + Send + Sync>),
}

impl ParamsSource {
    fn resolve(&self) -> serde_json::Map<String, Value> {
        match self {
            ParamsSource::None => serde_json::Map::new(),
            ParamsSource::Static(map) => map.clone(),
            ParamsSource::Closure(f) => f(),
        }
    }
}

/// Why the transport last closed, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseStatus {
    /// Nothing recorded; the server or network closed on us.
    Unknown,
    /// The user asked for the close with this code.
    Clean(u16),
    /// The client chose to close (heartbeat timeout) but wants back in.
    Abnormal,
}

impl CloseStatus {
    fn should_reconnect(&self) -> bool {
        matches!(self, CloseStatus::Unknown | CloseStatus::Abnormal)
    }
}

struct BufferedSend {
    reference: Option<String>,
    message: Message,
    as_binary: bool,
}

/// One logical connection to a server, multiplexing many channels.
///
/// Handles are cheap clones of the same underlying socket. The socket must
/// live inside a tokio runtime; its timers and the shipped transport spawn
/// tasks on it.
#[derive(Clone)]
pub struct Socket {
    core: Arc<SocketCore>,
}

pub(crate) struct SocketCore {
    endpoint: Url,
    params: ParamsSource,
    headers: HashMap<String, String>,
    timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_disabled: bool,
    serializer: Arc<dyn Serializer>,
    codec: Arc<dyn PayloadCodec>,
    factory: Arc<dyn TransportFactory>,

    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Bumped on every connect and teardown; delegate events from an
    /// orphaned transport carry an older generation and are ignored.
    generation: AtomicU64,
    ref_counter: AtomicU64,
    pending_heartbeat_ref: Mutex<Option<String>>,
    close_status: Mutex<CloseStatus>,
    channels: Mutex<Vec<Channel>>,
    send_buffer: Mutex<Vec<BufferedSend>>,
    heartbeat_timer: Mutex<Option<HeartbeatTimer>>,
    reconnect_timer: OnceLock<TimeoutTimer>,

    open_callbacks: SyncList<(String, OpenCallback)>,
    close_callbacks: SyncList<(String, CloseCallback)>,
    error_callbacks: SyncList<(String, ErrorCallback)>,
    message_callbacks: SyncList<(String, MessageCallback)>,
}

/// Builder for [`Socket`].
pub struct SocketBuilder {
    endpoint: String,
    params: ParamsSource,
    headers: HashMap<String, String>,
    timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_disabled: bool,
    serializer: Arc<dyn Serializer>,
    codec: Arc<dyn PayloadCodec>,
    factory: Option<Arc<dyn TransportFactory>>,
}

impl SocketBuilder {
    /// Starts a builder for the given endpoint.
    ///
    /// The endpoint scheme is normalized (`http(s)` becomes `ws(s)`, anything
    /// else becomes `ws`) and the path gains a trailing `/websocket`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: ParamsSource::None,
            headers: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_disabled: false,
            serializer: Arc::new(V2Serializer::new()),
            codec: Arc::new(JsonCodec::new()),
            factory: None,
        }
    }

    /// Static connect query parameters.
    pub fn params(mut self, params: serde_json::Map<String, Value>) -> Self {
        self.params = ParamsSource::Static(params);
        self
    }

    /// Connect query parameters recomputed on every (re)connect.
    pub fn params_closure(
        mut self,
        params: impl Fn() -> serde_json::Map<String, Value> + Send + Sync + 'static,
    ) -> Self {
        self.params = ParamsSource::Closure(Arc::new(params));
        self
    }

    /// Extra headers for the connection handshake.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Default join/push acknowledgement timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Disables heartbeats entirely. Meant for tests.
    pub fn disable_heartbeat(mut self) -> Self {
        self.heartbeat_disabled = true;
        self
    }

    /// Replaces the wire serializer.
    pub fn serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Replaces the payload codec.
    pub fn codec(mut self, codec: impl PayloadCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Sets the transport factory. Required.
    pub fn transport(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Builds the socket.
    ///
    /// # Panics
    ///
    /// Panics on a malformed endpoint URL or a missing transport factory;
    /// both are contract violations.
    pub fn build(self) -> Socket {
        let factory = self
            .factory
            .expect("a transport factory is required; pass one with .transport(..)");
        let core = Arc::new(SocketCore {
            endpoint: normalize_endpoint(&self.endpoint),
            params: self.params,
            headers: self.headers,
            timeout: self.timeout,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_disabled: self.heartbeat_disabled,
            serializer: self.serializer,
            codec: self.codec,
            factory,
            transport: Mutex::new(None),
            generation: AtomicU64::new(0),
            ref_counter: AtomicU64::new(0),
            pending_heartbeat_ref: Mutex::new(None),
            close_status: Mutex::new(CloseStatus::Unknown),
            channels: Mutex::new(Vec::new()),
            send_buffer: Mutex::new(Vec::new()),
            heartbeat_timer: Mutex::new(None),
            reconnect_timer: OnceLock::new(),
            open_callbacks: SyncList::new(),
            close_callbacks: SyncList::new(),
            error_callbacks: SyncList::new(),
            message_callbacks: SyncList::new(),
        });

        let weak = Arc::downgrade(&core);
        core.reconnect_timer
            .set(TimeoutTimer::new(
                move || {
                    if let Some(core) = weak.upgrade() {
                        core.reconnect_tick();
                    }
                },
                reconnect_after,
            ))
            .unwrap_or_else(|_| unreachable!("reconnect timer installed once"));

        Socket { core }
    }
}

impl Socket {
    /// Starts a [`SocketBuilder`] for the given endpoint.
    pub fn builder(endpoint: impl Into<String>) -> SocketBuilder {
        SocketBuilder::new(endpoint)
    }

    /// The full connect URL, with the wire version and current params.
    pub fn endpoint_url(&self) -> Url {
        self.core.endpoint_url()
    }

    /// Opens the transport. Idempotent while already open.
    pub fn connect(&self) {
        self.core.connect();
    }

    /// Closes the transport and stays closed: no reconnect is scheduled.
    pub fn disconnect(&self, code: Option<u16>, reason: Option<&str>) {
        self.core.disconnect(code, reason);
    }

    /// Creates a channel scoped to `topic` with a join payload.
    pub fn channel(&self, topic: impl Into<String>, params: Value) -> Channel {
        let channel = Channel::new(&self.core, topic.into(), params);
        self.core.channels.lock().push(channel.clone());
        channel
    }

    /// Registers a callback for transport open. Returns a subscription ref.
    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) -> String {
        self.core.register_open(callback)
    }

    /// Registers a callback for transport close. Returns a subscription ref.
    pub fn on_close(&self, callback: impl Fn(u16, Option<&str>) + Send + Sync + 'static) -> String {
        self.core.register_close(callback)
    }

    /// Registers a callback for socket faults. Returns a subscription ref.
    pub fn on_error(&self, callback: impl Fn(&SocketError) + Send + Sync + 'static) -> String {
        self.core.register_error(callback)
    }

    /// Registers a callback for every inbound message. Returns a
    /// subscription ref.
    pub fn on_message(&self, callback: impl Fn(&Message) + Send + Sync + 'static) -> String {
        self.core.register_message(callback)
    }

    /// Removes the subscriptions with the given refs.
    pub fn off(&self, refs: &[String]) {
        self.core.off(refs);
    }

    /// Drops every registered state-change callback.
    pub fn release_callbacks(&self) {
        self.core.open_callbacks.clear();
        self.core.close_callbacks.clear();
        self.core.error_callbacks.clear();
        self.core.message_callbacks.clear();
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Current transport state, `closed` when no transport exists.
    pub fn connection_state(&self) -> ReadyState {
        self.core.connection_state()
    }
}

impl SocketCore {
    pub(crate) fn endpoint_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("vsn", self.serializer.vsn());
            for (key, value) in self.params.resolve() {
                match value {
                    Value::String(s) => query.append_pair(&key, &s),
                    other => query.append_pair(&key, &other.to_string()),
                };
            }
        }
        url
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocates the next wire ref. Wraps to zero on overflow.
    pub(crate) fn make_ref(&self) -> String {
        let previous = self.ref_counter.fetch_add(1, Ordering::Relaxed);
        previous.wrapping_add(1).to_string()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection_state() == ReadyState::Open
    }

    pub(crate) fn connection_state(&self) -> ReadyState {
        self.transport
            .lock()
            .as_ref()
            .map(|transport| transport.ready_state())
            .unwrap_or(ReadyState::Closed)
    }

    /// Encodes a user payload.
    ///
    /// # Panics
    ///
    /// An unencodable payload is a contract violation by the caller.
    pub(crate) fn encode_payload(&self, value: &Value) -> Vec<u8> {
        self.codec
            .encode(value)
            .unwrap_or_else(|e| panic!("failed to encode payload: {e}"))
    }

    fn connect(self: &Arc<Self>) {
        if self.connection_state() != ReadyState::Closed {
            return;
        }
        *self.close_status.lock() = CloseStatus::Unknown;

        let url = self.endpoint_url();
        info!(url = %url, "connecting");

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let delegate = Arc::new(SocketDelegate {
            core: Arc::downgrade(self),
            generation,
        });
        let transport = self.factory.build(url, delegate);
        *self.transport.lock() = Some(Arc::clone(&transport));
        transport.connect(&self.headers);
    }

    fn disconnect(&self, code: Option<u16>, reason: Option<&str>) {
        let code = code.unwrap_or(close_code::NORMAL);
        *self.close_status.lock() = CloseStatus::Clean(code);
        self.reconnect_timer().reset();
        self.teardown(code, reason);
    }

    /// Drops the current transport and tells close subscribers.
    ///
    /// The delegate generation is bumped first so late events from the old
    /// transport cannot re-enter the state machine.
    fn teardown(&self, code: u16, reason: Option<&str>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.disconnect(code, reason);
        }
        if let Some(heartbeat) = self.heartbeat_timer.lock().take() {
            heartbeat.stop();
        }
        for (_, callback) in self.close_callbacks.snapshot().iter() {
            callback(code, reason);
        }
    }

    fn reconnect_tick(self: &Arc<Self>) {
        debug!("reconnect timer fired");
        self.teardown(close_code::NORMAL, Some("reconnection"));
        self.connect();
    }

    /// Chosen close that the server will see as clean, but that we treat as
    /// abnormal so the reconnect machinery kicks in.
    fn abnormal_close(&self, reason: &str) {
        *self.close_status.lock() = CloseStatus::Abnormal;
        let transport = self.transport.lock().clone();
        if let Some(transport) = transport {
            transport.disconnect(close_code::NORMAL, Some(reason));
        }
    }

    // -------------------------------------------------------------------------
    // Outbound path
    // -------------------------------------------------------------------------

    /// Sends now if connected, otherwise buffers until the next open.
    pub(crate) fn push_message(&self, message: Message, as_binary: bool) {
        if self.is_connected() {
            self.do_send(&message, as_binary);
        } else {
            trace!(topic = %message.topic, event = %message.event, "buffering until connected");
            self.send_buffer.lock().push(BufferedSend {
                reference: message.reference.clone(),
                message,
                as_binary,
            });
        }
    }

    fn do_send(&self, message: &Message, as_binary: bool) {
        let Some(transport) = self.transport.lock().clone() else {
            warn!(topic = %message.topic, event = %message.event, "no transport to send on");
            return;
        };
        trace!(
            topic = %message.topic,
            event = %message.event,
            reference = ?message.reference,
            join_ref = ?message.join_ref,
            "sending"
        );
        if as_binary {
            let frame = self.serializer.binary_encode(message);
            if let Err(e) = transport.send_binary(&frame) {
                warn!(error = %e, "binary send failed");
            }
        } else {
            match self.serializer.encode(message) {
                Ok(text) => {
                    if let Err(e) = transport.send_text(&text) {
                        warn!(error = %e, "send failed");
                    }
                }
                Err(e) => error!(error = %e, "failed to encode outbound message"),
            }
        }
    }

    /// Drains the send buffer FIFO. Entries that fail to send are dropped;
    /// the failure is already logged.
    fn flush_send_buffer(&self) {
        if !self.is_connected() {
            return;
        }
        let drained = std::mem::take(&mut *self.send_buffer.lock());
        for entry in drained {
            self.do_send(&entry.message, entry.as_binary);
        }
    }

    /// Cancels a buffered send by wire ref. Used by a channel that errors
    /// while its join is still queued.
    pub(crate) fn remove_from_send_buffer(&self, reference: &str) {
        self.send_buffer
            .lock()
            .retain(|entry| entry.reference.as_deref() != Some(reference));
    }

    // -------------------------------------------------------------------------
    // Heartbeat
    // -------------------------------------------------------------------------

    fn reset_heartbeat(self: &Arc<Self>) {
        *self.pending_heartbeat_ref.lock() = None;
        if let Some(previous) = self.heartbeat_timer.lock().take() {
            previous.stop();
        }
        if self.heartbeat_disabled {
            return;
        }
        let timer = HeartbeatTimer::new(self.heartbeat_interval);
        let weak = Arc::downgrade(self);
        timer.start(move || {
            if let Some(core) = weak.upgrade() {
                core.send_heartbeat();
            }
        });
        *self.heartbeat_timer.lock() = Some(timer);
    }

    fn send_heartbeat(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        let reference = {
            let mut pending = self.pending_heartbeat_ref.lock();
            if pending.take().is_some() {
                drop(pending);
                warn!("heartbeat went unacknowledged; closing to force a fresh connection");
                self.abnormal_close("heartbeat timeout");
                return;
            }
            let reference = self.make_ref();
            *pending = Some(reference.clone());
            reference
        };
        // Heartbeats are never buffered; a closed transport just skips one.
        self.do_send(
            &Message::message(None, Some(reference), PHOENIX_TOPIC, events::HEARTBEAT, Message::empty_payload()),
            false,
        );
    }

    // -------------------------------------------------------------------------
    // Channel registry
    // -------------------------------------------------------------------------

    /// Unsubscribes the channel's socket hooks and drops it from the list.
    pub(crate) fn remove_channel(&self, channel: &Arc<ChannelCore>) {
        self.off(&channel.take_socket_callback_refs());
        let join_ref = channel.join_ref();
        self.channels.lock().retain(|existing| {
            let same_instance = Arc::ptr_eq(existing.core(), channel);
            let same_join = join_ref.is_some() && existing.join_ref() == join_ref;
            !(same_instance || same_join)
        });
    }

    /// Tells any *other* channel open on `topic` to leave: at most one open
    /// channel per topic.
    pub(crate) fn leave_open_topic(&self, topic: &str, joining: &Arc<ChannelCore>) {
        let duplicate = self.channels.lock().iter().find(|existing| {
            existing.topic() == topic
                && matches!(existing.state(), ChannelState::Joined | ChannelState::Joining)
                && !Arc::ptr_eq(existing.core(), joining)
        }).cloned();
        if let Some(duplicate) = duplicate {
            warn!(topic = %topic, "leaving duplicate channel for topic");
            duplicate.leave(None);
        }
    }

    // -------------------------------------------------------------------------
    // State-change callbacks
    // -------------------------------------------------------------------------

    pub(crate) fn register_open(&self, callback: impl Fn() + Send + Sync + 'static) -> String {
        let reference = self.make_ref();
        self.open_callbacks.push((reference.clone(), Arc::new(callback)));
        reference
    }

    pub(crate) fn register_close(
        &self,
        callback: impl Fn(u16, Option<&str>) + Send + Sync + 'static,
    ) -> String {
        let reference = self.make_ref();
        self.close_callbacks.push((reference.clone(), Arc::new(callback)));
        reference
    }

    pub(crate) fn register_error(
        &self,
        callback: impl Fn(&SocketError) + Send + Sync + 'static,
    ) -> String {
        let reference = self.make_ref();
        self.error_callbacks.push((reference.clone(), Arc::new(callback)));
        reference
    }

    pub(crate) fn register_message(
        &self,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> String {
        let reference = self.make_ref();
        self.message_callbacks.push((reference.clone(), Arc::new(callback)));
        reference
    }

    pub(crate) fn off(&self, refs: &[String]) {
        self.open_callbacks.retain(|(r, _)| !refs.contains(r));
        self.close_callbacks.retain(|(r, _)| !refs.contains(r));
        self.error_callbacks.retain(|(r, _)| !refs.contains(r));
        self.message_callbacks.retain(|(r, _)| !refs.contains(r));
    }

    fn reconnect_timer(&self) -> &TimeoutTimer {
        self.reconnect_timer
            .get()
            .expect("reconnect timer installed at construction")
    }

    /// Errors every channel that still thinks it is (or is becoming) joined.
    fn trigger_channel_error(&self) {
        let channels = self.channels.lock().clone();
        for channel in channels {
            if matches!(
                channel.state(),
                ChannelState::Errored | ChannelState::Leaving | ChannelState::Closed
            ) {
                continue;
            }
            channel.core().trigger(Message::broadcast(
                channel.topic().to_owned(),
                events::ERROR,
                Message::empty_payload(),
            ));
        }
    }

    // -------------------------------------------------------------------------
    // Transport delegate path
    // -------------------------------------------------------------------------

    fn on_conn_open(self: &Arc<Self>, response: Option<String>) {
        info!(response = ?response, "transport open");
        self.flush_send_buffer();
        self.reset_heartbeat();
        self.reconnect_timer().reset();
        for (_, callback) in self.open_callbacks.snapshot().iter() {
            callback();
        }
    }

    fn on_conn_error(&self, error: TransportError, response: Option<String>) {
        error!(error = %error, response = ?response, "transport error");
        let socket_error = SocketError::Transport(error);
        for (_, callback) in self.error_callbacks.snapshot().iter() {
            callback(&socket_error);
        }
        self.trigger_channel_error();
    }

    fn on_conn_close(&self, code: u16, reason: Option<&str>) {
        info!(code = code, reason = ?reason, "transport closed");
        self.trigger_channel_error();
        if let Some(heartbeat) = self.heartbeat_timer.lock().take() {
            heartbeat.stop();
        }
        if self.close_status.lock().should_reconnect() {
            self.reconnect_timer().schedule_timeout();
        }
        for (_, callback) in self.close_callbacks.snapshot().iter() {
            callback(code, reason);
        }
    }

    fn on_conn_message(&self, message: Message) {
        trace!(
            topic = %message.topic,
            event = %message.event,
            reference = ?message.reference,
            "received"
        );
        if let Some(reference) = &message.reference {
            let mut pending = self.pending_heartbeat_ref.lock();
            if pending.as_deref() == Some(reference.as_str()) {
                trace!("heartbeat acknowledged");
                *pending = None;
            }
        }
        let channels = self.channels.lock().clone();
        for channel in channels {
            if channel.core().is_member(&message) {
                channel.core().trigger(message.clone());
            }
        }
        for (_, callback) in self.message_callbacks.snapshot().iter() {
            callback(&message);
        }
    }

    fn on_decode_error(&self, source: crate::error::SerializerError, bytes: Vec<u8>) {
        error!(error = %source, len = bytes.len(), "discarding undecodable frame");
        let socket_error = SocketError::Decode { source, bytes };
        for (_, callback) in self.error_callbacks.snapshot().iter() {
            callback(&socket_error);
        }
    }
}

/// The socket's ear on the transport. Holds the socket weakly: the
/// transport must not keep its owner alive.
struct SocketDelegate {
    core: Weak<SocketCore>,
    generation: u64,
}

impl SocketDelegate {
    fn current(&self) -> Option<Arc<SocketCore>> {
        let core = self.core.upgrade()?;
        if core.generation.load(Ordering::SeqCst) != self.generation {
            trace!("ignoring event from an orphaned transport");
            return None;
        }
        Some(core)
    }
}

impl TransportDelegate for SocketDelegate {
    fn on_open(&self, response: Option<String>) {
        if let Some(core) = self.current() {
            core.on_conn_open(response);
        }
    }

    fn on_error(&self, error: TransportError, response: Option<String>) {
        if let Some(core) = self.current() {
            core.on_conn_error(error, response);
        }
    }

    fn on_message_text(&self, text: &str) {
        let Some(core) = self.current() else { return };
        match core.serializer.decode(text) {
            Ok(message) => core.on_conn_message(message),
            Err(e) => core.on_decode_error(e, text.as_bytes().to_vec()),
        }
    }

    fn on_message_binary(&self, data: &[u8]) {
        let Some(core) = self.current() else { return };
        match core.serializer.binary_decode(data) {
            Ok(message) => core.on_conn_message(message),
            Err(e) => core.on_decode_error(e, data.to_vec()),
        }
    }

    fn on_close(&self, code: u16, reason: Option<&str>) {
        if let Some(core) = self.current() {
            core.on_conn_close(code, reason);
        }
    }
}

/// Normalizes a user endpoint into the socket URL.
///
/// # Panics
///
/// Panics on an unparseable endpoint; that is a contract violation.
fn normalize_endpoint(raw: &str) -> Url {
    let mut url = Url::parse(raw).unwrap_or_else(|e| panic!("malformed endpoint URL '{raw}': {e}"));
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        let rest = raw.split_once("://").map(|(_, rest)| rest).unwrap_or(raw);
        url = Url::parse(&format!("{scheme}://{rest}"))
            .unwrap_or_else(|e| panic!("malformed endpoint URL '{raw}': {e}"));
    }
    if !url.path().ends_with("/websocket") {
        let path = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{path}/websocket"));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHub;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_socket(hub: &Arc<MockHub>) -> Socket {
        Socket::builder("ws://example.com/chat")
            .disable_heartbeat()
            .transport(hub.factory())
            .build()
    }

    fn ok_reply(reference: &str, topic: &str) -> String {
        format!(r#"[null,"{reference}","{topic}","phx_reply",{{"response":{{}},"status":"ok"}}]"#)
    }

    #[test]
    fn normalizes_endpoint_urls() {
        let hub = MockHub::new();
        let socket = Socket::builder("https://example.com/chat")
            .transport(hub.factory())
            .build();
        assert_eq!(
            socket.endpoint_url().to_string(),
            "wss://example.com/chat/websocket?vsn=2.0.0"
        );

        let socket = Socket::builder("ws://example.com/chat/")
            .transport(hub.factory())
            .build();
        assert_eq!(
            socket.endpoint_url().to_string(),
            "ws://example.com/chat/websocket?vsn=2.0.0"
        );

        let mut params = serde_json::Map::new();
        params.insert("token".to_owned(), json!("abc123"));
        let socket = Socket::builder("http://example.com/chat")
            .params(params)
            .transport(hub.factory())
            .build();
        assert_eq!(
            socket.endpoint_url().to_string(),
            "ws://example.com/chat/websocket?vsn=2.0.0&token=abc123"
        );
    }

    #[test]
    fn closure_params_are_recomputed_per_call() {
        let hub = MockHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let socket = Socket::builder("ws://example.com/chat")
            .params_closure(move || {
                let n = counter_clone.fetch_add(1, Ordering::SeqCst);
                let mut map = serde_json::Map::new();
                map.insert("attempt".to_owned(), json!(n.to_string()));
                map
            })
            .transport(hub.factory())
            .build();
        assert!(socket.endpoint_url().to_string().ends_with("attempt=0"));
        assert!(socket.endpoint_url().to_string().ends_with("attempt=1"));
    }

    #[test]
    #[should_panic(expected = "malformed endpoint URL")]
    fn malformed_endpoint_is_fatal() {
        let hub = MockHub::new();
        Socket::builder("not a url").transport(hub.factory()).build();
    }

    #[test]
    fn refs_increase_and_wrap() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);
        assert_eq!(socket.core.make_ref(), "1");
        assert_eq!(socket.core.make_ref(), "2");

        socket.core.ref_counter.store(u64::MAX, Ordering::Relaxed);
        assert_eq!(socket.core.make_ref(), "0");
        assert_eq!(socket.core.make_ref(), "1");
    }

    #[tokio::test]
    async fn pushes_buffer_in_fifo_order_while_disconnected() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);

        socket.core.push_message(
            Message::message(None, Some("1".into()), "room:a", "one", Message::empty_payload()),
            false,
        );
        socket.core.push_message(
            Message::message(None, Some("2".into()), "room:a", "two", Message::empty_payload()),
            false,
        );

        // No transport was ever built, so nothing hit a wire.
        assert_eq!(hub.transport_count(), 0);
        let events: Vec<String> = socket
            .core
            .send_buffer
            .lock()
            .iter()
            .map(|entry| entry.message.event.clone())
            .collect();
        assert_eq!(events, vec!["one", "two"]);

        socket.core.remove_from_send_buffer("1");
        assert_eq!(socket.core.send_buffer.lock().len(), 1);
    }

    #[tokio::test]
    async fn open_drains_the_send_buffer_exactly_once() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);
        socket.core.push_message(
            Message::message(None, Some("1".into()), "room:a", "one", Message::empty_payload()),
            false,
        );

        socket.connect();
        hub.latest().open();

        assert_eq!(hub.latest().sent_events(), vec!["one"]);
        assert!(socket.core.send_buffer.lock().is_empty());
    }

    #[tokio::test]
    async fn missed_heartbeat_forces_reconnect() {
        let hub = MockHub::new();
        let socket = Socket::builder("ws://example.com/chat")
            .heartbeat_interval(Duration::from_millis(25))
            .transport(hub.factory())
            .build();
        socket.connect();
        let first = hub.latest();
        first.open();

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(first.sent_events(), vec!["heartbeat"]);

        // The first heartbeat was never acknowledged.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(first.disconnects.lock().iter().any(|(code, reason)| {
            *code == close_code::NORMAL && reason.as_deref() == Some("heartbeat timeout")
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(hub.transport_count() >= 2, "expected a reconnect attempt");
    }

    #[tokio::test]
    async fn acknowledged_heartbeat_keeps_the_connection() {
        let hub = MockHub::new();
        let socket = Socket::builder("ws://example.com/chat")
            .heartbeat_interval(Duration::from_millis(25))
            .transport(hub.factory())
            .build();
        socket.connect();
        let transport = hub.latest();
        transport.open();

        tokio::time::sleep(Duration::from_millis(35)).await;
        let reference = transport.sent_ref(0);
        transport.deliver_text(&ok_reply(&reference, "phoenix"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.sent_events(), vec!["heartbeat", "heartbeat"]);
        assert!(transport.disconnects.lock().is_empty());
        assert_eq!(hub.transport_count(), 1);
    }

    #[tokio::test]
    async fn transport_close_errors_channels_and_reconnects() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);
        socket.connect();
        hub.latest().open();

        let channel = socket.channel("room:lobby", json!({}));
        channel.join(None);
        let join_ref = channel.join_ref().unwrap();
        hub.latest().deliver_text(&ok_reply(&join_ref, "room:lobby"));
        assert!(channel.is_joined());

        hub.latest().server_close(close_code::ABNORMAL);
        assert!(channel.is_errored());
        assert!(!socket.is_connected());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(hub.transport_count() >= 2, "expected a reconnect attempt");

        // The fresh transport opening drives an immediate rejoin.
        hub.latest().open();
        assert!(channel.is_joining());
        assert_eq!(hub.latest().sent_events(), vec!["phx_join"]);
        assert_ne!(hub.latest().sent_ref(0), join_ref);
    }

    #[tokio::test]
    async fn clean_disconnect_stays_closed() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);
        let closes = Arc::new(Mutex::new(Vec::new()));
        let closes_clone = Arc::clone(&closes);
        socket.on_close(move |code, reason| {
            closes_clone.lock().push((code, reason.map(str::to_owned)));
        });

        socket.connect();
        hub.latest().open();
        socket.disconnect(None, Some("bye"));

        assert_eq!(
            hub.latest().disconnects.lock().as_slice(),
            &[(close_code::NORMAL, Some("bye".to_owned()))]
        );
        assert_eq!(
            closes.lock().as_slice(),
            &[(close_code::NORMAL, Some("bye".to_owned()))]
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hub.transport_count(), 1, "clean close must not reconnect");
    }

    #[tokio::test]
    async fn transport_error_surfaces_without_disconnecting() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = Arc::clone(&errors);
        socket.on_error(move |error| {
            assert!(matches!(error, SocketError::Transport(_)));
            errors_clone.fetch_add(1, Ordering::SeqCst);
        });

        socket.connect();
        hub.latest().open();
        let channel = socket.channel("room:lobby", json!({}));
        channel.join(None);
        hub.latest()
            .deliver_text(&ok_reply(&channel.join_ref().unwrap(), "room:lobby"));
        assert!(channel.is_joined());

        hub.latest().server_error("boom");

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(channel.is_errored());
        assert!(socket.is_connected(), "errors alone must not drop the transport");
    }

    #[tokio::test]
    async fn undecodable_frame_is_reported_and_dropped() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        socket.on_error(move |error| {
            if let SocketError::Decode { bytes, .. } = error {
                seen_clone.lock().push(bytes.clone());
            }
        });

        socket.connect();
        hub.latest().open();
        hub.latest().deliver_text("not json");

        assert_eq!(seen.lock().as_slice(), &[b"not json".to_vec()]);
        assert!(socket.is_connected(), "a bad frame must not close the connection");
    }

    #[tokio::test]
    async fn stale_lifecycle_messages_are_dropped() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);
        socket.connect();
        hub.latest().open();

        let channel = socket.channel("room:lobby", json!({}));
        channel.join(None);
        hub.latest()
            .deliver_text(&ok_reply(&channel.join_ref().unwrap(), "room:lobby"));
        assert!(channel.is_joined());

        // A lifecycle event from a previous join attempt must not touch us.
        hub.latest().deliver_text(r#"["999",null,"room:lobby","phx_error",{}]"#);
        assert!(channel.is_joined());

        // A non-lifecycle event with a foreign join_ref is still delivered.
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        channel.on("new_msg", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        hub.latest().deliver_text(r#"["999",null,"room:lobby","new_msg",{}]"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_state_callbacks() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);
        let opens = Arc::new(AtomicUsize::new(0));

        let opens_a = Arc::clone(&opens);
        let ref_a = socket.on_open(move || {
            opens_a.fetch_add(1, Ordering::SeqCst);
        });
        let opens_b = Arc::clone(&opens);
        socket.on_open(move || {
            opens_b.fetch_add(1, Ordering::SeqCst);
        });

        socket.core.on_conn_open(None);
        assert_eq!(opens.load(Ordering::SeqCst), 2);

        socket.off(&[ref_a]);
        socket.core.on_conn_open(None);
        assert_eq!(opens.load(Ordering::SeqCst), 3);

        socket.release_callbacks();
        socket.core.on_conn_open(None);
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplicate_topic_join_leaves_the_open_channel() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);
        socket.connect();
        hub.latest().open();

        let first = socket.channel("room:lobby", json!({}));
        first.join(None);
        hub.latest()
            .deliver_text(&ok_reply(&first.join_ref().unwrap(), "room:lobby"));
        assert!(first.is_joined());

        let second = socket.channel("room:lobby", json!({}));
        second.join(None);

        // The duplicate leaves (its close path runs locally right away)
        // and only the new channel stays on the topic.
        assert!(first.is_closed());
        assert!(second.is_joining());
        let remaining: Vec<String> = socket
            .core
            .channels
            .lock()
            .iter()
            .map(|ch| ch.topic().to_owned())
            .collect();
        assert_eq!(remaining, vec!["room:lobby"]);
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_open() {
        let hub = MockHub::new();
        let socket = test_socket(&hub);
        socket.connect();
        hub.latest().open();
        socket.connect();
        assert_eq!(hub.transport_count(), 1);
        assert_eq!(socket.connection_state(), ReadyState::Open);
    }
}
