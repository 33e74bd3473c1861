//! Topic-scoped conversation over a socket.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::message::{Message, events};
use crate::push::Push;
use crate::registry::SyncList;
use crate::socket::SocketCore;
use crate::timer::{TimeoutTimer, rejoin_after};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not joined; the initial and terminal state.
    Closed,
    /// Join failed or the transport dropped; a rejoin is pending.
    Errored,
    /// The server acknowledged the join.
    Joined,
    /// A join is in flight.
    Joining,
    /// A leave is in flight.
    Leaving,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
            ChannelState::Joined => "joined",
            ChannelState::Joining => "joining",
            ChannelState::Leaving => "leaving",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
struct Binding {
    event: String,
    reference: u64,
    callback: Arc<dyn Fn(Message) + Send + Sync>,
}

type MessageHook = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// A multiplexed conversation on one topic.
///
/// Created through [`Socket::channel`](crate::socket::Socket::channel).
/// Handles are cheap clones of the same underlying channel.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

pub(crate) struct ChannelCore {
    topic: String,
    socket: Weak<SocketCore>,
    state: Mutex<ChannelState>,
    bindings: SyncList<Binding>,
    binding_ref: AtomicU64,
    timeout: Mutex<Duration>,
    joined_once: AtomicBool,
    join_push: OnceLock<Push>,
    push_buffer: Mutex<Vec<Push>>,
    rejoin_timer: OnceLock<TimeoutTimer>,
    on_message: Mutex<MessageHook>,
    socket_callback_refs: Mutex<Vec<String>>,
}

impl Channel {
    pub(crate) fn new(socket: &Arc<SocketCore>, topic: String, params: Value) -> Self {
        let timeout = socket.default_timeout();
        let core = Arc::new(ChannelCore {
            topic,
            socket: Arc::downgrade(socket),
            state: Mutex::new(ChannelState::Closed),
            bindings: SyncList::new(),
            binding_ref: AtomicU64::new(0),
            timeout: Mutex::new(timeout),
            joined_once: AtomicBool::new(false),
            join_push: OnceLock::new(),
            push_buffer: Mutex::new(Vec::new()),
            rejoin_timer: OnceLock::new(),
            on_message: Mutex::new(Arc::new(|message| message) as MessageHook),
            socket_callback_refs: Mutex::new(Vec::new()),
        });

        let join_push = Push::new(
            Arc::downgrade(&core),
            events::JOIN,
            socket.encode_payload(&params),
            timeout,
            false,
        );
        core.install_join_hooks(&join_push);
        core.join_push
            .set(join_push)
            .unwrap_or_else(|_| unreachable!("join push installed once"));

        let weak = Arc::downgrade(&core);
        core.rejoin_timer
            .set(TimeoutTimer::new(
                move || {
                    if let Some(channel) = weak.upgrade()
                        && channel.socket_connected()
                    {
                        channel.rejoin(None);
                    }
                },
                rejoin_after,
            ))
            .unwrap_or_else(|_| unreachable!("rejoin timer installed once"));

        core.install_self_bindings();
        core.install_socket_hooks(socket);

        Self { core }
    }

    /// Joins the topic. Returns the join push so reply hooks can be chained.
    ///
    /// # Panics
    ///
    /// Panics if called more than once on the same channel; create a new
    /// channel to join again after a leave.
    pub fn join(&self, timeout: Option<Duration>) -> Push {
        let already_joined = self.core.joined_once.swap(true, Ordering::SeqCst);
        assert!(
            !already_joined,
            "tried to join channel '{}' multiple times; a channel joins once for its lifetime",
            self.core.topic
        );
        if let Some(timeout) = timeout {
            *self.core.timeout.lock() = timeout;
        }
        self.core.rejoin(timeout);
        self.core.join_push().clone()
    }

    /// Subscribes a callback to an event. Returns the binding ref for
    /// targeted removal via [`off`](Channel::off).
    pub fn on(&self, event: impl Into<String>, callback: impl Fn(Message) + Send + Sync + 'static) -> u64 {
        self.core.subscribe(&event.into(), callback)
    }

    /// Removes bindings for an event, optionally narrowed to one ref.
    pub fn off(&self, event: &str, reference: Option<u64>) {
        self.core.unsubscribe(event, reference);
    }

    /// Sugar for subscribing to channel close.
    pub fn on_close(&self, callback: impl Fn(Message) + Send + Sync + 'static) -> u64 {
        self.on(events::CLOSE, callback)
    }

    /// Sugar for subscribing to channel errors.
    pub fn on_error(&self, callback: impl Fn(Message) + Send + Sync + 'static) -> u64 {
        self.on(events::ERROR, callback)
    }

    /// Replaces the inbound message transform applied before dispatch.
    pub fn on_message(&self, transform: impl Fn(Message) -> Message + Send + Sync + 'static) {
        *self.core.on_message.lock() = Arc::new(transform);
    }

    /// Pushes an event with a JSON payload.
    ///
    /// If the socket is open and the channel joined, the push goes out
    /// immediately; otherwise it is buffered (with its timeout running)
    /// until the join succeeds.
    ///
    /// # Panics
    ///
    /// Panics if the channel was never joined, or if `event` is a reserved
    /// lifecycle event.
    pub fn push(&self, event: impl Into<String>, payload: Value, timeout: Option<Duration>) -> Push {
        let Some(socket) = self.core.socket() else {
            panic!("tried to push on a channel whose socket is gone");
        };
        self.push_bytes(event.into(), socket.encode_payload(&payload), timeout, false)
    }

    /// Pushes an event with an opaque binary payload.
    ///
    /// # Panics
    ///
    /// Same contract as [`push`](Channel::push).
    pub fn binary_push(&self, event: impl Into<String>, data: Vec<u8>, timeout: Option<Duration>) -> Push {
        self.push_bytes(event.into(), data, timeout, true)
    }

    fn push_bytes(&self, event: String, payload: Vec<u8>, timeout: Option<Duration>, as_binary: bool) -> Push {
        assert!(
            self.core.joined_once.load(Ordering::SeqCst),
            "tried to push '{}' to '{}' before joining; call join() first",
            event,
            self.core.topic
        );
        assert!(
            !events::is_lifecycle(&event),
            "'{event}' is a reserved lifecycle event and cannot be pushed"
        );
        let timeout = timeout.unwrap_or(*self.core.timeout.lock());
        let push = Push::new(Arc::downgrade(&self.core), event, payload, timeout, as_binary);
        if self.core.can_push() {
            push.send();
        } else {
            push.start_timeout();
            self.core.push_buffer.lock().push(push.clone());
        }
        push
    }

    /// Leaves the topic.
    ///
    /// Unsubscribes from server events and stops any pending rejoin. The
    /// local close path runs whether the server acknowledges or the leave
    /// times out.
    pub fn leave(&self, timeout: Option<Duration>) -> Push {
        let core = &self.core;
        core.rejoin_timer().reset();
        core.set_state(ChannelState::Leaving);

        let timeout = timeout.unwrap_or(*core.timeout.lock());
        let push = Push::new(
            Arc::downgrade(core),
            events::LEAVE,
            Message::empty_payload(),
            timeout,
            false,
        );

        let close = {
            let weak = Arc::downgrade(core);
            Arc::new(move || {
                let Some(channel) = weak.upgrade() else { return };
                trace!(topic = %channel.topic, "leave acknowledged");
                channel.trigger(Message::broadcast(
                    channel.topic.clone(),
                    events::CLOSE,
                    br#"{"reason":"leave"}"#.to_vec(),
                ));
            })
        };
        let on_ok = Arc::clone(&close);
        push.receive("ok", move |_| on_ok())
            .receive(crate::push::TIMEOUT_STATUS, move |_| close());

        push.send();
        if !core.can_push() {
            push.trigger("ok", Value::Object(Default::default()));
        }
        push
    }

    /// The topic this channel is scoped to.
    pub fn topic(&self) -> &str {
        &self.core.topic
    }

    /// The ref of the join push that opened the current channel instance.
    pub fn join_ref(&self) -> Option<String> {
        self.core.join_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.core.state.lock()
    }

    /// Whether the channel is `closed`.
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Whether the channel is `errored`.
    pub fn is_errored(&self) -> bool {
        self.state() == ChannelState::Errored
    }

    /// Whether the channel is `joined`.
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    /// Whether the channel is `joining`.
    pub fn is_joining(&self) -> bool {
        self.state() == ChannelState::Joining
    }

    /// Whether the channel is `leaving`.
    pub fn is_leaving(&self) -> bool {
        self.state() == ChannelState::Leaving
    }

    pub(crate) fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }
}

impl ChannelCore {
    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn join_ref(&self) -> Option<String> {
        self.join_push().reference()
    }

    pub(crate) fn socket(&self) -> Option<Arc<SocketCore>> {
        self.socket.upgrade()
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Pushes can hit the wire only while the socket is open and the join
    /// is acknowledged.
    pub(crate) fn can_push(&self) -> bool {
        self.socket_connected() && self.state() == ChannelState::Joined
    }

    /// Whether an inbound message belongs to this channel.
    ///
    /// Lifecycle events tagged with a `join_ref` other than the current one
    /// belong to an earlier join attempt and are dropped.
    pub(crate) fn is_member(&self, message: &Message) -> bool {
        if message.topic != self.topic {
            return false;
        }
        if message.join_ref.is_some()
            && message.join_ref != self.join_ref()
            && events::is_lifecycle(&message.event)
        {
            warn!(
                topic = %self.topic,
                event = %message.event,
                join_ref = ?message.join_ref,
                "dropping stale message from a previous join"
            );
            return false;
        }
        true
    }

    /// Runs the message transform, then every binding for the event, in
    /// registration order.
    pub(crate) fn trigger(&self, message: Message) {
        let transform = Arc::clone(&*self.on_message.lock());
        let message = transform(message);
        let bindings = self.bindings.snapshot();
        for binding in bindings.iter().filter(|b| b.event == message.event) {
            (binding.callback)(message.clone());
        }
    }

    pub(crate) fn subscribe(&self, event: &str, callback: impl Fn(Message) + Send + Sync + 'static) -> u64 {
        let reference = self.binding_ref.fetch_add(1, Ordering::Relaxed);
        self.bindings.push(Binding {
            event: event.to_owned(),
            reference,
            callback: Arc::new(callback),
        });
        reference
    }

    pub(crate) fn unsubscribe(&self, event: &str, reference: Option<u64>) {
        self.bindings.retain(|binding| {
            binding.event != event || reference.is_some_and(|r| r != binding.reference)
        });
    }

    /// Re-sends the join push and enters `joining`.
    ///
    /// No-op while leaving. At most one open channel may exist per topic,
    /// so any sibling still joined to it is told to leave first.
    pub(crate) fn rejoin(self: &Arc<Self>, timeout: Option<Duration>) {
        if self.state() == ChannelState::Leaving {
            return;
        }
        if let Some(socket) = self.socket() {
            socket.leave_open_topic(&self.topic, self);
        }
        self.set_state(ChannelState::Joining);
        let timeout = timeout.unwrap_or(*self.timeout.lock());
        self.join_push().resend(timeout);
    }

    pub(crate) fn join_push(&self) -> &Push {
        self.join_push.get().expect("join push installed at construction")
    }

    pub(crate) fn rejoin_timer(&self) -> &TimeoutTimer {
        self.rejoin_timer.get().expect("rejoin timer installed at construction")
    }

    fn set_state(&self, next: ChannelState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(topic = %self.topic, from = %*state, to = %next, "channel state change");
            *state = next;
        }
    }

    fn socket_connected(&self) -> bool {
        self.socket().is_some_and(|socket| socket.is_connected())
    }

    fn schedule_rejoin_if_connected(&self) {
        if self.socket_connected() {
            self.rejoin_timer().schedule_timeout();
        }
    }

    /// The join push's receive hooks drive the state machine.
    fn install_join_hooks(self: &Arc<Self>, join_push: &Push) {
        let weak = Arc::downgrade(self);
        join_push.receive("ok", move |_| {
            let Some(channel) = weak.upgrade() else { return };
            channel.set_state(ChannelState::Joined);
            channel.rejoin_timer().reset();
            let buffered = std::mem::take(&mut *channel.push_buffer.lock());
            for push in buffered {
                push.send();
            }
        });

        let weak = Arc::downgrade(self);
        join_push.receive("error", move |_| {
            let Some(channel) = weak.upgrade() else { return };
            channel.set_state(ChannelState::Errored);
            channel.schedule_rejoin_if_connected();
        });

        let weak = Arc::downgrade(self);
        join_push.receive(crate::push::TIMEOUT_STATUS, move |_| {
            let Some(channel) = weak.upgrade() else { return };
            warn!(topic = %channel.topic, "join timed out");
            // Tell the server to drop the half-open join; no reply expected.
            let leave = Push::new(
                Arc::downgrade(&channel),
                events::LEAVE,
                Message::empty_payload(),
                *channel.timeout.lock(),
                false,
            );
            leave.send();
            channel.set_state(ChannelState::Errored);
            channel.join_push().reset();
            channel.schedule_rejoin_if_connected();
        });
    }

    fn install_self_bindings(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.subscribe(events::CLOSE, move |_| {
            let Some(channel) = weak.upgrade() else { return };
            trace!(topic = %channel.topic, "channel closed");
            channel.rejoin_timer().reset();
            channel.set_state(ChannelState::Closed);
            if let Some(socket) = channel.socket() {
                socket.remove_channel(&channel);
            }
        });

        let weak = Arc::downgrade(self);
        self.subscribe(events::ERROR, move |_| {
            let Some(channel) = weak.upgrade() else { return };
            if channel.state() == ChannelState::Joining {
                // The join may still be sitting in the socket's send buffer.
                if let (Some(socket), Some(join_ref)) = (channel.socket(), channel.join_ref()) {
                    socket.remove_from_send_buffer(&join_ref);
                }
                channel.join_push().reset();
            }
            channel.set_state(ChannelState::Errored);
            channel.schedule_rejoin_if_connected();
        });

        // Replies surface to the originating push as a synthetic event
        // keyed by ref, so the push's one-shot binding can match it.
        let weak = Arc::downgrade(self);
        self.subscribe(events::REPLY, move |message| {
            let Some(channel) = weak.upgrade() else { return };
            let Some(reference) = message.reference.clone() else { return };
            channel.trigger(Message {
                event: format!("chan_reply_{reference}"),
                ..message
            });
        });
    }

    /// A transport open resets backoff and revives errored channels; a
    /// transport error just resets backoff (the next open drives rejoin).
    fn install_socket_hooks(self: &Arc<Self>, socket: &Arc<SocketCore>) {
        let weak = Arc::downgrade(self);
        let open_ref = socket.register_open(move || {
            let Some(channel) = weak.upgrade() else { return };
            channel.rejoin_timer().reset();
            if channel.state() == ChannelState::Errored {
                channel.rejoin(None);
            }
        });

        let weak = Arc::downgrade(self);
        let error_ref = socket.register_error(move |_| {
            let Some(channel) = weak.upgrade() else { return };
            channel.rejoin_timer().reset();
        });

        *self.socket_callback_refs.lock() = vec![open_ref, error_ref];
    }

    pub(crate) fn take_socket_callback_refs(&self) -> Vec<String> {
        std::mem::take(&mut *self.socket_callback_refs.lock())
    }
}
