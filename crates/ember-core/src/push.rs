//! A single outbound message with timeout and status-keyed reply hooks.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::channel::ChannelCore;
use crate::message::Message;
use crate::registry::SyncList;

/// Reply status fired when the server never answers in time.
pub const TIMEOUT_STATUS: &str = "timeout";

#[derive(Clone)]
struct ReceiveHook {
    status: String,
    callback: Arc<dyn Fn(&Message) + Send + Sync>,
}

/// An outbound message awaiting acknowledgement.
///
/// A push is created by its channel and handed back to the caller so reply
/// hooks can be chained:
///
/// ```rust,ignore
/// channel
///     .push("new_msg", json!({"body": "hi"}), None)
///     .receive("ok", |msg| println!("acked: {:?}", msg))
///     .receive("timeout", |_| println!("server never answered"));
/// ```
///
/// The wire ref is assigned at send time and cleared by [`reset`](Push::reset),
/// so a re-sent push correlates with a fresh reply.
#[derive(Clone)]
pub struct Push {
    core: Arc<PushCore>,
}

pub(crate) struct PushCore {
    channel: Weak<ChannelCore>,
    event: String,
    payload: Vec<u8>,
    timeout: Mutex<Duration>,
    as_binary: bool,
    received: Mutex<Option<Message>>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
    hooks: SyncList<ReceiveHook>,
    sent: AtomicBool,
    reference: Mutex<Option<String>>,
    ref_event: Mutex<Option<String>>,
}

impl Push {
    pub(crate) fn new(
        channel: Weak<ChannelCore>,
        event: impl Into<String>,
        payload: Vec<u8>,
        timeout: Duration,
        as_binary: bool,
    ) -> Self {
        Self {
            core: Arc::new(PushCore {
                channel,
                event: event.into(),
                payload,
                timeout: Mutex::new(timeout),
                as_binary,
                received: Mutex::new(None),
                timeout_task: Mutex::new(None),
                hooks: SyncList::new(),
                sent: AtomicBool::new(false),
                reference: Mutex::new(None),
                ref_event: Mutex::new(None),
            }),
        }
    }

    /// Registers a hook for a reply status.
    ///
    /// If a matching reply already arrived, the callback fires immediately
    /// with the cached message; otherwise it is appended and fires when the
    /// reply (or local timeout) lands. Chainable.
    pub fn receive(&self, status: impl Into<String>, callback: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        let status = status.into();
        let cached = self
            .core
            .received
            .lock()
            .as_ref()
            .filter(|msg| msg.status.as_deref() == Some(status.as_str()))
            .cloned();
        match cached {
            Some(msg) => callback(&msg),
            None => self.core.hooks.push(ReceiveHook {
                status,
                callback: Arc::new(callback),
            }),
        }
        self.clone()
    }

    /// Sends the push over the channel's socket.
    ///
    /// A push that was already sent only re-arms its timeout; everything
    /// else allocates a fresh ref, installs the one-shot reply binding,
    /// arms the timeout, then hands the message to the socket.
    pub fn send(&self) {
        if self.has_received(TIMEOUT_STATUS) {
            return;
        }
        let already_sent = self.core.sent.load(Ordering::Acquire);
        self.start_timeout();
        if already_sent {
            return;
        }
        self.core.sent.store(true, Ordering::Release);

        let Some(channel) = self.core.channel.upgrade() else {
            return;
        };
        let Some(socket) = channel.socket() else {
            return;
        };
        let message = Message {
            join_ref: channel.join_ref(),
            reference: self.reference(),
            topic: channel.topic().to_owned(),
            event: self.core.event.clone(),
            payload: self.core.payload.clone(),
            status: None,
        };
        socket.push_message(message, self.core.as_binary);
    }

    /// Arms the timeout and reply binding without sending.
    ///
    /// Used when a push is buffered while its channel has not joined yet:
    /// the clock runs even though nothing has hit the wire.
    pub fn start_timeout(&self) {
        if let Some(task) = self.core.timeout_task.lock().take() {
            task.abort();
        }
        // A previous arm may have left a binding for a stale ref behind.
        self.cancel_ref_event();

        let Some(channel) = self.core.channel.upgrade() else {
            return;
        };
        let Some(socket) = channel.socket() else {
            return;
        };

        let reference = socket.make_ref();
        let ref_event = format!("chan_reply_{reference}");
        *self.core.reference.lock() = Some(reference);
        *self.core.ref_event.lock() = Some(ref_event.clone());

        let weak = Arc::downgrade(&self.core);
        channel.subscribe(&ref_event, move |message| {
            if let Some(core) = weak.upgrade() {
                Push { core }.handle_reply(message);
            }
        });

        let timeout = *self.core.timeout.lock();
        let weak = Arc::downgrade(&self.core);
        *self.core.timeout_task.lock() = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(core) = weak.upgrade() {
                trace!(event = %core.event, "push timed out");
                Push { core }.trigger(TIMEOUT_STATUS, Value::Object(Default::default()));
            }
        }));
    }

    /// Returns the push to its pre-send state.
    ///
    /// The next [`send`](Push::send) allocates a new ref, so late replies to
    /// the old one no longer match.
    pub fn reset(&self) {
        self.cancel_ref_event();
        self.cancel_timeout();
        *self.core.reference.lock() = None;
        *self.core.ref_event.lock() = None;
        *self.core.received.lock() = None;
        self.core.sent.store(false, Ordering::Release);
    }

    /// Delivers a synthetic reply through the normal hook fan-out.
    pub(crate) fn trigger(&self, status: &str, payload: Value) {
        let Some(ref_event) = self.core.ref_event.lock().clone() else {
            return;
        };
        let Some(channel) = self.core.channel.upgrade() else {
            return;
        };
        let payload = match payload {
            Value::String(s) => s.into_bytes(),
            other => serde_json::to_vec(&other).unwrap_or_else(|_| Message::empty_payload()),
        };
        channel.trigger(Message {
            join_ref: channel.join_ref(),
            reference: self.reference(),
            topic: channel.topic().to_owned(),
            event: ref_event,
            payload,
            status: Some(status.to_owned()),
        });
    }

    /// The wire ref currently assigned, if armed.
    pub fn reference(&self) -> Option<String> {
        self.core.reference.lock().clone()
    }

    /// The event this push carries.
    pub fn event(&self) -> &str {
        &self.core.event
    }

    /// Overrides the pending timeout duration for subsequent arms.
    pub(crate) fn set_timeout(&self, timeout: Duration) {
        *self.core.timeout.lock() = timeout;
    }

    /// Cancels and re-sends with a fresh ref.
    pub(crate) fn resend(&self, timeout: Duration) {
        self.set_timeout(timeout);
        self.reset();
        self.send();
    }

    fn has_received(&self, status: &str) -> bool {
        self.core
            .received
            .lock()
            .as_ref()
            .is_some_and(|msg| msg.status.as_deref() == Some(status))
    }

    /// Reply path: cache, stop the clock, fan out, then drop the binding so
    /// a misbehaving server cannot deliver twice.
    fn handle_reply(&self, message: Message) {
        self.cancel_timeout();
        *self.core.received.lock() = Some(message.clone());

        let status = message.status.clone().unwrap_or_default();
        let hooks = self.core.hooks.snapshot();
        for hook in hooks.iter().filter(|hook| hook.status == status) {
            (hook.callback)(&message);
        }

        self.cancel_ref_event();
    }

    fn cancel_ref_event(&self) {
        let Some(ref_event) = self.core.ref_event.lock().clone() else {
            return;
        };
        if let Some(channel) = self.core.channel.upgrade() {
            channel.unsubscribe(&ref_event, None);
        }
    }

    fn cancel_timeout(&self) {
        if let Some(task) = self.core.timeout_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for PushCore {
    fn drop(&mut self) {
        if let Some(task) = self.timeout_task.lock().take() {
            task.abort();
        }
    }
}
