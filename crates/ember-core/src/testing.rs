//! Transport test doubles.
//!
//! `MockHub` stands in for the transport factory; every transport it builds
//! is recorded so tests can play the server: open the connection, deliver
//! frames, drop the link.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use url::Url;

use crate::error::{TransportError, TransportResult};
use crate::transport::{ReadyState, Transport, TransportDelegate, TransportFactory};

pub(crate) struct MockHub {
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transports: Mutex::new(Vec::new()),
        })
    }

    pub fn factory(self: &Arc<Self>) -> impl TransportFactory + 'static {
        let hub = Arc::clone(self);
        move |url: Url, delegate: Arc<dyn TransportDelegate>| {
            let transport = Arc::new(MockTransport {
                url,
                delegate,
                state: Mutex::new(ReadyState::Closed),
                sent_text: Mutex::new(Vec::new()),
                sent_binary: Mutex::new(Vec::new()),
                disconnects: Mutex::new(Vec::new()),
                connect_headers: Mutex::new(None),
            });
            hub.transports.lock().push(Arc::clone(&transport));
            transport as Arc<dyn Transport>
        }
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn latest(&self) -> Arc<MockTransport> {
        self.transports
            .lock()
            .last()
            .cloned()
            .expect("no transport was built")
    }
}

pub(crate) struct MockTransport {
    pub url: Url,
    delegate: Arc<dyn TransportDelegate>,
    state: Mutex<ReadyState>,
    pub sent_text: Mutex<Vec<String>>,
    pub sent_binary: Mutex<Vec<Vec<u8>>>,
    pub disconnects: Mutex<Vec<(u16, Option<String>)>>,
    pub connect_headers: Mutex<Option<HashMap<String, String>>>,
}

impl MockTransport {
    /// Simulates the server accepting the connection.
    pub fn open(&self) {
        *self.state.lock() = ReadyState::Open;
        self.delegate.on_open(None);
    }

    /// Simulates the server (or network) dropping the connection.
    pub fn server_close(&self, code: u16) {
        *self.state.lock() = ReadyState::Closed;
        self.delegate.on_close(code, None);
    }

    /// Simulates a transport fault without a close.
    pub fn server_error(&self, reason: &str) {
        self.delegate
            .on_error(TransportError::SendFailed(reason.to_owned()), None);
    }

    /// Delivers an inbound text frame.
    pub fn deliver_text(&self, text: &str) {
        self.delegate.on_message_text(text);
    }

    /// Delivers an inbound binary frame.
    pub fn deliver_binary(&self, data: &[u8]) {
        self.delegate.on_message_binary(data);
    }

    /// Events of every text frame sent so far, in send order.
    pub fn sent_events(&self) -> Vec<String> {
        self.sent_text
            .lock()
            .iter()
            .map(|frame| {
                let parts: serde_json::Value = serde_json::from_str(frame).expect("sent frame is JSON");
                parts[3].as_str().expect("frame has an event").to_owned()
            })
            .collect()
    }

    /// The ref of the nth text frame sent.
    pub fn sent_ref(&self, index: usize) -> String {
        let frame = self.sent_text.lock()[index].clone();
        let parts: serde_json::Value = serde_json::from_str(&frame).expect("sent frame is JSON");
        parts[1].as_str().expect("frame has a ref").to_owned()
    }
}

impl Transport for MockTransport {
    fn connect(&self, headers: &HashMap<String, String>) {
        *self.connect_headers.lock() = Some(headers.clone());
        *self.state.lock() = ReadyState::Connecting;
    }

    fn disconnect(&self, code: u16, reason: Option<&str>) {
        self.disconnects
            .lock()
            .push((code, reason.map(str::to_owned)));
        let was_closed = {
            let mut state = self.state.lock();
            let was_closed = *state == ReadyState::Closed;
            *state = ReadyState::Closed;
            was_closed
        };
        if !was_closed {
            self.delegate.on_close(code, reason);
        }
    }

    fn send_text(&self, text: &str) -> TransportResult<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::NotConnected);
        }
        self.sent_text.lock().push(text.to_owned());
        Ok(())
    }

    fn send_binary(&self, data: &[u8]) -> TransportResult<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::NotConnected);
        }
        self.sent_binary.lock().push(data.to_vec());
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }
}
