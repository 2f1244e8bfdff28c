//! Topic channels.
//!
//! A [`Channel`] is one topic multiplexed over a [`Socket`]. It tracks the
//! membership state machine, routes inbound events to callbacks and keeps the
//! topic's presence set in sync.

use crate::presence::{Meta, Presence, PresenceConfig, PresenceMap};
use crate::push::{Push, ReceiveStatus};
use crate::reply::{self, ReplyError};
use crate::socket::{Socket, SocketInner, DEFAULT_SOCKET_NAME};
use beacon_protocol::events::event;
use beacon_protocol::{Envelope, Payload};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

/// Callback invoked with an inbound envelope.
pub type EventCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Hook invoked with the join acknowledgment payload.
pub type JoinedHook = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Hook invoked after a full presence snapshot is applied.
pub type PresenceUpdateHook = Arc<dyn Fn(&Presence) + Send + Sync>;

/// Channel membership state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Not a member.
    #[default]
    Closed,
    /// Join sent, awaiting acknowledgment.
    Joining,
    /// Member of the topic.
    Joined,
    /// Leave sent, awaiting acknowledgment.
    Leaving,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Closed => "closed",
            ChannelState::Joining => "joining",
            ChannelState::Joined => "joined",
            ChannelState::Leaving => "leaving",
        };
        f.write_str(name)
    }
}

/// How `join` and `leave` treat calls from an unexpected state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// Always send.
    #[default]
    Permissive,
    /// Reject `join` while joining or joined and `leave` while leaving or
    /// closed.
    Strict,
}

/// Channel settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Membership transition handling.
    pub transitions: TransitionPolicy,
    /// Presence synchronization.
    pub presence: PresenceConfig,
}

#[derive(Default)]
struct ChannelHooks {
    on_joined: Option<JoinedHook>,
    on_presence_update: Option<PresenceUpdateHook>,
}

struct ChannelInner {
    topic: String,
    params: Payload,
    config: ChannelConfig,
    socket: Weak<SocketInner>,
    state: watch::Sender<ChannelState>,
    callbacks: Mutex<HashMap<String, EventCallback>>,
    hooks: Mutex<ChannelHooks>,
    presence: Mutex<Presence>,
}

/// A topic on a socket.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.inner.topic)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        topic: impl Into<String>,
        params: Payload,
        config: ChannelConfig,
        socket: Weak<SocketInner>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Closed);
        let channel = Self {
            inner: Arc::new(ChannelInner {
                topic: topic.into(),
                params,
                config,
                socket,
                state,
                callbacks: Mutex::new(HashMap::new()),
                hooks: Mutex::new(ChannelHooks::default()),
                presence: Mutex::new(Presence::with_config(config.presence)),
            }),
        };
        channel.install_presence_wiring();
        channel
    }

    /// The topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// The join parameters.
    #[must_use]
    pub fn params(&self) -> &Payload {
        &self.inner.params
    }

    /// Current membership state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Watch membership state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// The owning socket, while it exists.
    #[must_use]
    pub fn socket(&self) -> Option<Socket> {
        self.inner.socket.upgrade().map(Socket::from_inner)
    }

    /// A snapshot of the presence set.
    #[must_use]
    pub fn presence(&self) -> Presence {
        self.inner.presence.lock().clone()
    }

    /// Borrow the presence set.
    ///
    /// `f` runs under the presence lock and must not call back into this
    /// channel.
    pub fn with_presence<R>(&self, f: impl FnOnce(&Presence) -> R) -> R {
        f(&self.inner.presence.lock())
    }

    /// Whether two handles refer to the same channel.
    #[must_use]
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register the callback for an event, replacing any previous one.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> &Self
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .lock()
            .insert(event.into(), Arc::new(callback));
        self
    }

    /// Register the hook fired on a successful join.
    pub fn on_joined<F>(&self, hook: F) -> &Self
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.inner.hooks.lock().on_joined = Some(Arc::new(hook));
        self
    }

    /// Register the hook fired after a full presence snapshot.
    pub fn on_presence_update<F>(&self, hook: F) -> &Self
    where
        F: Fn(&Presence) + Send + Sync + 'static,
    {
        self.inner.hooks.lock().on_presence_update = Some(Arc::new(hook));
        self
    }

    /// Register the hook fired per joining presence session.
    pub fn on_presence_join<F>(&self, hook: F) -> &Self
    where
        F: Fn(&str, &Meta) + Send + Sync + 'static,
    {
        self.inner.presence.lock().on_join(hook);
        self
    }

    /// Register the hook fired per leaving presence session.
    pub fn on_presence_leave<F>(&self, hook: F) -> &Self
    where
        F: Fn(&str, &Meta) + Send + Sync + 'static,
    {
        self.inner.presence.lock().on_leave(hook);
        self
    }

    /// Register the hook fired with the presence state after a change.
    pub fn on_presence_state_change<F>(&self, hook: F) -> &Self
    where
        F: Fn(&PresenceMap) + Send + Sync + 'static,
    {
        self.inner.presence.lock().on_state_change(hook);
        self
    }

    /// Route an inbound envelope to its event callback.
    pub fn received(&self, envelope: &Envelope) {
        let callback = self.inner.callbacks.lock().get(&envelope.event).cloned();
        match callback {
            Some(callback) => callback(envelope),
            None => trace!(topic = %self.inner.topic, event = %envelope.event, "No callback"),
        }
    }

    /// Join the topic.
    pub fn join(&self) -> Push {
        self.join_with(|_| {})
    }

    /// Join the topic and decode the acknowledgment `response` as `T`.
    pub fn join_typed<T, F>(&self, completion: F) -> Push
    where
        T: DeserializeOwned + 'static,
        F: FnOnce(Result<T, ReplyError>) + Send + 'static,
    {
        let context = reply::join_context(&self.socket_name());
        self.join_with(move |push| {
            reply::attach_typed(push, context, reply::JOIN_REJECTED, completion);
        })
    }

    /// Join the topic and wait for the decoded acknowledgment.
    pub fn join_async<T>(&self) -> impl Future<Output = Result<T, ReplyError>> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let context = reply::join_context(&self.socket_name());
        let (tx, rx) = oneshot::channel();
        self.join_typed(move |result| {
            let _ = tx.send(result);
        });
        abandoned_or(rx, context)
    }

    fn join_with(&self, attach: impl FnOnce(&Push)) -> Push {
        let push = Push::new(self.inner.topic.clone(), event::JOIN, self.inner.params.clone());

        if self.rejects(&[ChannelState::Joining, ChannelState::Joined]) {
            attach(&push);
            push.handle_rejected(format!("Channel is already {}", self.state()));
            return push;
        }

        self.inner.state.send_replace(ChannelState::Joining);
        debug!(topic = %self.inner.topic, "Joining channel");

        let weak = Arc::downgrade(&self.inner);
        push.receive(ReceiveStatus::Ok, move |payload| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.state.send_replace(ChannelState::Joined);
            debug!(topic = %inner.topic, "Joined channel");

            let hook = inner.hooks.lock().on_joined.clone();
            if let Some(hook) = hook {
                hook(payload);
            }
        });
        attach(&push);

        self.dispatch(push)
    }

    /// Leave the topic.
    pub fn leave(&self) -> Push {
        self.leave_with(|_| {})
    }

    pub(crate) fn leave_with(&self, attach: impl FnOnce(&Push)) -> Push {
        let push = Push::new(self.inner.topic.clone(), event::LEAVE, Payload::new());

        if self.rejects(&[ChannelState::Leaving, ChannelState::Closed]) {
            attach(&push);
            push.handle_rejected(format!("Channel is already {}", self.state()));
            return push;
        }

        self.inner.state.send_replace(ChannelState::Leaving);
        debug!(topic = %self.inner.topic, "Leaving channel");

        let weak = Arc::downgrade(&self.inner);
        push.receive(ReceiveStatus::Ok, move |_| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.callbacks.lock().clear();
            inner.presence.lock().clear_hooks();
            inner.hooks.lock().on_joined = None;

            Channel { inner }.on_left();
        });
        attach(&push);

        self.dispatch(push)
    }

    fn on_left(&self) {
        self.install_presence_wiring();
        self.inner.state.send_replace(ChannelState::Closed);
        debug!(topic = %self.inner.topic, "Left channel");
    }

    /// Send an event on the topic.
    pub fn send(&self, event: impl Into<String>, payload: Payload) -> Push {
        self.dispatch(Push::new(self.inner.topic.clone(), event, payload))
    }

    /// Send an event and decode the acknowledgment `response` as `T`.
    pub fn send_typed<T, F>(&self, event: impl Into<String>, payload: Payload, completion: F) -> Push
    where
        T: DeserializeOwned + 'static,
        F: FnOnce(Result<T, ReplyError>) + Send + 'static,
    {
        let push = Push::new(self.inner.topic.clone(), event, payload);
        let context = reply::send_context(&self.socket_name(), push.event());
        reply::attach_typed(&push, context, reply::SEND_REJECTED, completion);
        self.dispatch(push)
    }

    /// Send an event and wait for the decoded acknowledgment.
    pub fn send_async<T>(
        &self,
        event: impl Into<String>,
        payload: Payload,
    ) -> impl Future<Output = Result<T, ReplyError>> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let event = event.into();
        let context = reply::send_context(&self.socket_name(), &event);
        let (tx, rx) = oneshot::channel();
        self.send_typed(event, payload, move |result| {
            let _ = tx.send(result);
        });
        abandoned_or(rx, context)
    }

    fn dispatch(&self, push: Push) -> Push {
        match self.inner.socket.upgrade() {
            Some(socket) => socket.send(push),
            None => {
                debug!(topic = %self.inner.topic, "Socket is gone");
                push.handle_not_connected();
                push
            }
        }
    }

    fn rejects(&self, states: &[ChannelState]) -> bool {
        self.inner.config.transitions == TransitionPolicy::Strict
            && states.contains(&self.state())
    }

    fn socket_name(&self) -> String {
        self.inner
            .socket
            .upgrade()
            .map_or_else(|| DEFAULT_SOCKET_NAME.to_string(), |s| s.name().to_string())
    }

    fn install_presence_wiring(&self) {
        for name in [event::PRESENCE_STATE, event::PRESENCE_DIFF] {
            let weak = Arc::downgrade(&self.inner);
            self.on(name, move |envelope| {
                if let Some(inner) = weak.upgrade() {
                    sync_presence(&inner, envelope);
                }
            });
        }
    }
}

fn sync_presence(inner: &ChannelInner, envelope: &Envelope) {
    let (events, hooks) = {
        let mut presence = inner.presence.lock();
        (presence.apply(envelope), presence.hooks())
    };
    hooks.dispatch(&events);

    if envelope.event == event::PRESENCE_STATE {
        let hook = inner.hooks.lock().on_presence_update.clone();
        if let Some(hook) = hook {
            let snapshot = inner.presence.lock().clone();
            hook(&snapshot);
        }
    }
}

async fn abandoned_or<T>(
    rx: oneshot::Receiver<Result<T, ReplyError>>,
    context: String,
) -> Result<T, ReplyError> {
    rx.await.unwrap_or_else(|_| {
        Err(ReplyError::Rejected {
            context,
            reason: "Reply abandoned".to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{eventually, payload, MockTransport};
    use crate::socket::{Socket, SocketConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn connected_socket(config: SocketConfig) -> (Socket, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let socket = Socket::new(transport.clone(), config);
        socket.connect();
        eventually(|| socket.is_connected()).await;
        (socket, transport)
    }

    fn ack(push: &Push, status: &str, response: serde_json::Value) -> String {
        json!({
            "topic": push.topic(),
            "event": event::REPLY,
            "payload": {"status": status, "response": response},
            "ref": push.reference(),
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_join_and_leave_lifecycle() {
        let (socket, transport) = connected_socket(SocketConfig::default()).await;
        let channel = socket.channel("room:lobby", payload(json!({"token": "t"})));
        let mut states = channel.subscribe_state();
        assert_eq!(*states.borrow_and_update(), ChannelState::Closed);

        let joined = Arc::new(AtomicUsize::new(0));
        let j = Arc::clone(&joined);
        channel.on_joined(move |_| {
            j.fetch_add(1, Ordering::SeqCst);
        });

        let push = channel.join();
        assert_eq!(channel.state(), ChannelState::Joining);

        eventually(|| transport.written().len() == 1).await;
        let sent = transport.written_envelopes();
        assert_eq!(sent[0].event, event::JOIN);
        assert_eq!(sent[0].payload["token"], json!("t"));

        transport.push_message(ack(&push, "ok", json!({})));
        eventually(|| channel.state() == ChannelState::Joined).await;
        assert_eq!(joined.load(Ordering::SeqCst), 1);

        channel.on("new_msg", |_| {});
        let push = channel.leave();
        assert_eq!(channel.state(), ChannelState::Leaving);
        transport.push_message(ack(&push, "ok", json!({})));
        eventually(|| channel.state() == ChannelState::Closed).await;

        // Event callbacks were cleared, presence wiring survives.
        let callbacks = channel.inner.callbacks.lock();
        assert!(!callbacks.contains_key("new_msg"));
        assert!(callbacks.contains_key(event::PRESENCE_STATE));
        assert!(callbacks.contains_key(event::PRESENCE_DIFF));
    }

    #[tokio::test]
    async fn test_leave_clears_presence_and_joined_hooks() {
        let (socket, transport) = connected_socket(SocketConfig::default()).await;
        let channel = socket.channel("room:lobby", Payload::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        channel.on_joined(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = Arc::clone(&fired);
        channel.on_presence_join(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = Arc::clone(&fired);
        channel.on_presence_leave(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = Arc::clone(&fired);
        channel.on_presence_state_change(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let push = channel.leave();
        transport.push_message(ack(&push, "ok", json!({})));
        eventually(|| channel.state() == ChannelState::Closed).await;

        channel.received(&Envelope::new(
            "room:lobby",
            event::PRESENCE_STATE,
            payload(json!({"u1": {"metas": [{"phx_ref": "a"}]}})),
        ));
        channel.received(&Envelope::new(
            "room:lobby",
            event::PRESENCE_DIFF,
            payload(json!({
                "joins": {"u2": {"metas": [{"phx_ref": "b"}]}},
                "leaves": {"u1": {"metas": [{"phx_ref": "a"}]}},
            })),
        ));
        // Presence wiring still applies diffs.
        assert_eq!(channel.with_presence(|p| p.ids()), vec!["u2".to_string()]);

        let push = channel.join();
        transport.push_message(ack(&push, "ok", json!({})));
        eventually(|| channel.state() == ChannelState::Joined).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_join_error_keeps_joining() {
        let (socket, transport) = connected_socket(SocketConfig::default()).await;
        let channel = socket.channel("room:1", Payload::new());

        let push = channel.join();
        transport.push_message(ack(&push, "error", json!({"reason": "nope"})));
        eventually(|| push.is_resolved()).await;
        assert_eq!(channel.state(), ChannelState::Joining);
    }

    #[tokio::test]
    async fn test_on_replaces_callback() {
        let channel = Channel::new("room:1", Payload::new(), ChannelConfig::default(), Weak::new());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        channel.on("new_msg", move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        channel.on("new_msg", move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        channel.received(&Envelope::new("room:1", "new_msg", Payload::new()));
        channel.received(&Envelope::new("room:1", "unknown", Payload::new()));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_without_socket() {
        let channel = Channel::new("room:1", Payload::new(), ChannelConfig::default(), Weak::new());
        let push = channel.send("new_msg", Payload::new());
        let reply = push.reply_snapshot().unwrap();
        assert_eq!(reply.status, "error");
        assert_eq!(reply.reason(), Some("Not connected to socket."));
    }

    #[tokio::test]
    async fn test_presence_wiring() {
        let channel = Channel::new("room:1", Payload::new(), ChannelConfig::default(), Weak::new());
        let updates = Arc::new(AtomicUsize::new(0));
        let joins = Arc::new(AtomicUsize::new(0));

        let u = Arc::clone(&updates);
        channel.on_presence_update(move |presence| {
            assert_eq!(presence.count(), 1);
            u.fetch_add(1, Ordering::SeqCst);
        });
        let j = Arc::clone(&joins);
        channel.on_presence_join(move |_, _| {
            j.fetch_add(1, Ordering::SeqCst);
        });

        channel.received(&Envelope::new(
            "room:1",
            event::PRESENCE_STATE,
            payload(json!({"u1": {"metas": [{"phx_ref": "a"}]}})),
        ));
        channel.received(&Envelope::new(
            "room:1",
            event::PRESENCE_DIFF,
            payload(json!({"joins": {"u2": {"metas": [{"phx_ref": "b"}]}}, "leaves": {}})),
        ));

        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(channel.presence().count(), 2);
        assert!(channel.with_presence(|p| p.metas("u2").is_some()));
    }

    #[derive(Debug, Deserialize)]
    struct Foo {
        foo: u32,
    }

    #[tokio::test]
    async fn test_join_typed_ok_and_error() {
        let (socket, transport) = connected_socket(SocketConfig::default()).await;
        let channel = socket.channel("room:1", Payload::new());

        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let push = channel.join_typed::<Foo, _>(move |result| *s.lock() = Some(result));
        transport.push_message(ack(&push, "ok", json!({"foo": 1})));
        eventually(|| seen.lock().is_some()).await;
        assert_eq!(seen.lock().take().unwrap().unwrap().foo, 1);

        let s = Arc::clone(&seen);
        let push = channel.join_typed::<Foo, _>(move |result| *s.lock() = Some(result));
        transport.push_message(ack(&push, "error", json!({"reason": "unauthorized"})));
        eventually(|| seen.lock().is_some()).await;
        let err = seen.lock().take().unwrap().unwrap_err();
        assert!(err.to_string().contains("unauthorized"));
        assert!(err.to_string().starts_with("[Beacon Socket] Join Error"));
    }

    #[tokio::test]
    async fn test_send_async() {
        let (socket, transport) = connected_socket(SocketConfig::default()).await;
        let channel = socket.channel("room:1", Payload::new());

        let waiter = tokio::spawn(channel.send_async::<Foo>("get", Payload::new()));
        eventually(|| transport.written().len() == 1).await;
        let sent = transport.written_envelopes().remove(0);

        transport.push_message(
            json!({
                "topic": "room:1",
                "event": event::REPLY,
                "payload": {"status": "error", "response": {}},
                "ref": sent.reference,
            })
            .to_string(),
        );

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            "[Beacon Socket] Send - get Error: Command not accepted"
        );
    }

    #[tokio::test]
    async fn test_strict_transitions() {
        let config = SocketConfig {
            channel: ChannelConfig {
                transitions: TransitionPolicy::Strict,
                ..ChannelConfig::default()
            },
            ..SocketConfig::default()
        };
        let (socket, transport) = connected_socket(config).await;
        let channel = socket.channel("room:1", Payload::new());

        let leave = channel.leave();
        assert_eq!(
            leave.reply_snapshot().unwrap().reason(),
            Some("Channel is already closed")
        );

        channel.join();
        let again = channel.join();
        assert_eq!(
            again.reply_snapshot().unwrap().reason(),
            Some("Channel is already joining")
        );
        eventually(|| transport.written().len() == 1).await;
        assert_eq!(channel.state(), ChannelState::Joining);
    }
}
