//! The socket engine.
//!
//! One [`Socket`] owns one transport connection and multiplexes every
//! [`Channel`] over it. Three tasks run per socket:
//!
//! - the event loop, draining transport events
//! - the writer, draining the outbound frame queue
//! - the heartbeat loop, started on the first connect
//!
//! All of them stop when the socket is shut down or its last handle drops.

use crate::channel::{Channel, ChannelConfig};
use crate::push::{Push, PushFailure, ReceiveStatus};
use beacon_protocol::events::{is_heartbeat_ref, PHOENIX_TOPIC};
use beacon_protocol::{EnvelopeCodec, Payload, MAX_FRAME_SIZE};
use beacon_transport::{
    event_channel, EventReceiver, EventSender, Transport, TransportError, TransportEvent,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Log target for heartbeat traffic.
pub const HEARTBEAT_TARGET: &str = "beacon::heartbeat";

/// Name used when none is configured.
pub const DEFAULT_SOCKET_NAME: &str = "Beacon Socket";

const RTT_CAPACITY: usize = 64;

/// What happens to pushes still awaiting a reply when the connection drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPushPolicy {
    /// Forget them without resolving.
    #[default]
    Drop,
    /// Resolve each with `Socket disconnected.`.
    Fail,
}

/// Socket settings.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Name used in logs and reply errors.
    pub name: String,
    /// Time between heartbeats.
    pub heartbeat_interval: Duration,
    /// Delay before a stalled connect is retried.
    pub connect_retry_delay: Duration,
    /// Unanswered heartbeats tolerated before forcing a disconnect.
    pub heartbeat_failure_tolerance: Option<usize>,
    /// Largest frame encoded or decoded.
    pub max_frame_size: usize,
    /// Pending push handling on disconnect.
    pub pending_pushes: PendingPushPolicy,
    /// Settings for channels created by this socket.
    pub channel: ChannelConfig,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SOCKET_NAME.to_string(),
            heartbeat_interval: Duration::from_secs(5),
            connect_retry_delay: Duration::from_secs(3),
            heartbeat_failure_tolerance: None,
            max_frame_size: MAX_FRAME_SIZE,
            pending_pushes: PendingPushPolicy::default(),
            channel: ChannelConfig::default(),
        }
    }
}

/// Coarse connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketHealth {
    /// No connection attempt has completed yet.
    Unknown,
    /// Connected with no heartbeat outstanding.
    Connected,
    /// Connected with heartbeats outstanding.
    Caution,
    /// Outstanding heartbeats exceed the tolerance.
    Warning,
    /// The connection dropped.
    Disconnected,
}

impl fmt::Display for SocketHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketHealth::Unknown => "unknown",
            SocketHealth::Connected => "connected",
            SocketHealth::Caution => "caution",
            SocketHealth::Warning => "warning",
            SocketHealth::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;
type DisconnectHook = Arc<dyn Fn(Option<&TransportError>) + Send + Sync>;

#[derive(Default)]
struct SocketHooks {
    on_connect: Option<Hook>,
    on_disconnect: Option<DisconnectHook>,
    on_sending_heartbeat: Option<Hook>,
    on_received_heartbeat: Option<Hook>,
}

struct SocketState {
    channels: HashMap<String, Channel>,
    outstanding: HashMap<String, Push>,
    connected: bool,
    connecting: bool,
    dropped: bool,
    heartbeat_started: bool,
    heartbeat_failure_tolerance: Option<usize>,
    last_round_trip: Option<Duration>,
}

impl SocketState {
    fn heartbeats_pending(&self) -> usize {
        self.outstanding
            .keys()
            .filter(|reference| is_heartbeat_ref(reference))
            .count()
    }
}

pub(crate) struct SocketInner {
    config: SocketConfig,
    codec: EnvelopeCodec,
    transport: Arc<dyn Transport>,
    state: Mutex<SocketState>,
    hooks: Mutex<SocketHooks>,
    events_tx: EventSender,
    writer_tx: mpsc::UnboundedSender<Bytes>,
    rtt_tx: broadcast::Sender<Duration>,
    shutdown: CancellationToken,
    span: Span,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A multiplexed connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("name", &self.inner.config.name)
            .field("url", &self.inner.transport.url())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Socket {
    /// Create a socket over `transport`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: SocketConfig) -> Self {
        let (events_tx, events_rx) = event_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (rtt_tx, _) = broadcast::channel(RTT_CAPACITY);
        let shutdown = CancellationToken::new();
        let span = info_span!("socket", name = %config.name);

        let inner = Arc::new(SocketInner {
            codec: EnvelopeCodec::new(config.max_frame_size),
            state: Mutex::new(SocketState {
                channels: HashMap::new(),
                outstanding: HashMap::new(),
                connected: false,
                connecting: false,
                dropped: false,
                heartbeat_started: false,
                heartbeat_failure_tolerance: config.heartbeat_failure_tolerance,
                last_round_trip: None,
            }),
            config,
            transport: Arc::clone(&transport),
            hooks: Mutex::new(SocketHooks::default()),
            events_tx,
            writer_tx,
            rtt_tx,
            shutdown: shutdown.clone(),
            span: span.clone(),
        });

        tokio::spawn(
            run_event_loop(Arc::downgrade(&inner), events_rx, shutdown.clone())
                .instrument(span.clone()),
        );
        tokio::spawn(run_writer(transport, writer_rx, shutdown).instrument(span));

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<SocketInner>) -> Self {
        Self { inner }
    }

    /// The configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// The transport endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        self.inner.transport.url()
    }

    /// Open the connection.
    ///
    /// Does nothing when connected. When a previous attempt is still pending,
    /// schedules one retry check after the connect retry delay.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Close the connection, if connected.
    pub fn disconnect(&self) {
        if !self.inner.state.lock().connected {
            debug!(parent: &self.inner.span, "Not connected, ignoring disconnect");
            return;
        }
        self.inner.force_disconnect();
    }

    /// Tear the transport down unconditionally.
    pub fn force_disconnect(&self) {
        self.inner.force_disconnect();
    }

    /// Stop every socket task and close the transport.
    pub fn shutdown(&self) {
        self.inner.force_disconnect();
        self.inner.shutdown.cancel();
    }

    /// Create a channel for `topic`, replacing any registered one.
    pub fn channel(&self, topic: impl Into<String>, params: Payload) -> Channel {
        let channel = Channel::new(
            topic,
            params,
            self.inner.config.channel,
            Arc::downgrade(&self.inner),
        );
        let replaced = self
            .inner
            .state
            .lock()
            .channels
            .insert(channel.topic().to_string(), channel.clone());

        if replaced.is_some() {
            debug!(parent: &self.inner.span, topic = %channel.topic(), "Replaced channel");
        }
        channel
    }

    /// Leave `channel` and unregister it once the leave is acknowledged.
    pub fn remove(&self, channel: &Channel) -> Push {
        let weak = Arc::downgrade(&self.inner);
        let target = channel.clone();
        channel.leave_with(move |push| {
            push.receive(ReceiveStatus::Ok, move |_| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut state = inner.state.lock();
                let same = state
                    .channels
                    .get(target.topic())
                    .is_some_and(|registered| registered.ptr_eq(&target));
                if same {
                    state.channels.remove(target.topic());
                }
            });
        })
    }

    /// Send a push.
    pub fn send(&self, push: Push) -> Push {
        self.inner.send(push)
    }

    /// Register the hook fired when the connection opens.
    pub fn on_connect<F>(&self, hook: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hooks.lock().on_connect = Some(Arc::new(hook));
        self
    }

    /// Register the hook fired when the connection drops.
    pub fn on_disconnect<F>(&self, hook: F) -> &Self
    where
        F: Fn(Option<&TransportError>) + Send + Sync + 'static,
    {
        self.inner.hooks.lock().on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Register the hook fired after each heartbeat is sent.
    pub fn on_sending_heartbeat<F>(&self, hook: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hooks.lock().on_sending_heartbeat = Some(Arc::new(hook));
        self
    }

    /// Register the hook fired for each inbound heartbeat topic message.
    pub fn on_received_heartbeat<F>(&self, hook: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hooks.lock().on_received_heartbeat = Some(Arc::new(hook));
        self
    }

    /// Whether the connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    /// Whether a connection attempt is pending.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.inner.state.lock().connecting
    }

    /// Heartbeats sent and not yet answered.
    #[must_use]
    pub fn number_of_heartbeats_pending(&self) -> usize {
        self.inner.state.lock().heartbeats_pending()
    }

    /// Unanswered heartbeats tolerated before forcing a disconnect.
    #[must_use]
    pub fn heartbeat_failure_tolerance(&self) -> Option<usize> {
        self.inner.state.lock().heartbeat_failure_tolerance
    }

    /// Set the heartbeat failure tolerance. `None` disables the check.
    pub fn set_heartbeat_failure_tolerance(&self, tolerance: Option<usize>) {
        self.inner.state.lock().heartbeat_failure_tolerance = tolerance;
    }

    /// Current connection health.
    #[must_use]
    pub fn health(&self) -> SocketHealth {
        let state = self.inner.state.lock();
        if state.connected {
            let pending = state.heartbeats_pending();
            match state.heartbeat_failure_tolerance {
                Some(tolerance) if pending > tolerance => SocketHealth::Warning,
                _ if pending > 0 => SocketHealth::Caution,
                _ => SocketHealth::Connected,
            }
        } else if state.dropped {
            SocketHealth::Disconnected
        } else {
            SocketHealth::Unknown
        }
    }

    /// The most recent reply round trip.
    #[must_use]
    pub fn last_round_trip_time(&self) -> Option<Duration> {
        self.inner.state.lock().last_round_trip
    }

    /// Stream of reply round trip samples.
    #[must_use]
    pub fn round_trip_times(&self) -> broadcast::Receiver<Duration> {
        self.inner.rtt_tx.subscribe()
    }

    /// Topics of the registered channels.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.inner.state.lock().channels.keys().cloned().collect()
    }
}

impl SocketInner {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    fn connect(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.connected {
            debug!(parent: &self.span, "Already connected");
            return;
        }
        if state.connecting {
            drop(state);
            debug!(parent: &self.span, "Connect already pending");
            self.schedule_connect_check();
            return;
        }
        state.connecting = true;
        drop(state);

        info!(parent: &self.span, url = %self.transport.url(), "Connecting");
        self.transport.connect(self.events_tx.clone());
    }

    fn schedule_connect_check(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.config.connect_retry_delay;
        let shutdown = self.shutdown.clone();

        tokio::spawn(
            async move {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let stalled = {
                    let mut state = inner.state.lock();
                    let stalled = state.connecting;
                    state.connecting = false;
                    stalled
                };
                if stalled {
                    warn!(?delay, "Connect stalled, retrying");
                    inner.transport.disconnect();
                    inner.connect();
                }
            }
            .instrument(self.span.clone()),
        );
    }

    fn force_disconnect(&self) {
        self.state.lock().connected = false;
        self.transport.disconnect();
    }

    pub(crate) fn send(self: &Arc<Self>, push: Push) -> Push {
        let mut state = self.state.lock();

        if !state.connected {
            drop(state);
            debug!(
                parent: &self.span,
                topic = %push.topic(),
                event = %push.event(),
                "Not connected, failing push"
            );
            push.handle_not_connected();
            return push;
        }

        let data = match self.codec.encode(push.envelope()) {
            Ok(data) => data,
            Err(e) => {
                drop(state);
                warn!(
                    parent: &self.span,
                    topic = %push.topic(),
                    event = %push.event(),
                    error = %e,
                    "Failed to encode push"
                );
                push.handle_parse_error();
                return push;
            }
        };

        if push.is_heartbeat() {
            let pending = state.heartbeats_pending();
            if let Some(tolerance) = state.heartbeat_failure_tolerance {
                if pending > tolerance {
                    drop(state);
                    warn!(
                        target: HEARTBEAT_TARGET,
                        parent: &self.span,
                        pending,
                        tolerance,
                        "Heartbeat timeout, disconnecting"
                    );
                    push.handle_failure(&PushFailure::HeartbeatTimeout);
                    self.force_disconnect();
                    return push;
                }
            }
            debug!(
                target: HEARTBEAT_TARGET,
                parent: &self.span,
                reference = %push.reference(),
                pending,
                "S_Heartbeat"
            );
        } else {
            debug!(
                parent: &self.span,
                topic = %push.topic(),
                event = %push.event(),
                reference = %push.reference(),
                "Sending"
            );
        }

        if push.envelope().has_ref() {
            state
                .outstanding
                .insert(push.reference().to_string(), push.clone());
        }

        // Enqueued under the lock so frames leave in send order.
        if self.writer_tx.send(data).is_err() {
            warn!(parent: &self.span, "Writer stopped, dropping frame");
        }
        drop(state);

        push
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected(error) => self.on_disconnected(error),
            TransportEvent::Message(text) => self.on_message(&text),
        }
    }

    fn on_connected(self: &Arc<Self>) {
        let start_heartbeat = {
            let mut state = self.state.lock();
            state.connecting = false;
            state.connected = true;
            !std::mem::replace(&mut state.heartbeat_started, true)
        };
        info!(url = %self.transport.url(), "Connected");

        let hook = self.hooks.lock().on_connect.clone();
        if let Some(hook) = hook {
            hook();
        }

        if start_heartbeat {
            tokio::spawn(
                run_heartbeat(
                    Arc::downgrade(self),
                    self.config.heartbeat_interval,
                    self.shutdown.clone(),
                )
                .instrument(self.span.clone()),
            );
        }
    }

    fn on_disconnected(self: &Arc<Self>, error: Option<TransportError>) {
        {
            let mut state = self.state.lock();
            state.connected = false;
            state.dropped = true;
        }
        match &error {
            Some(e) => warn!(error = %e, "Disconnected"),
            None => info!("Disconnected"),
        }

        let hook = self.hooks.lock().on_disconnect.clone();
        if let Some(hook) = hook {
            hook(error.as_ref());
        }

        let (pending, channels) = {
            let mut state = self.state.lock();
            state.connected = false;
            state.connecting = false;
            (
                std::mem::take(&mut state.outstanding),
                std::mem::take(&mut state.channels),
            )
        };
        debug!(
            pending = pending.len(),
            channels = channels.len(),
            "Cleared registries"
        );

        if self.config.pending_pushes == PendingPushPolicy::Fail {
            for push in pending.into_values() {
                push.handle_disconnected();
            }
        }
    }

    fn on_message(self: &Arc<Self>, text: &str) {
        let envelope = match self.codec.decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        let (push, channel) = {
            let mut state = self.state.lock();
            let push = if envelope.has_ref() {
                state.outstanding.remove(&envelope.reference)
            } else {
                None
            };
            if let Some(push) = &push {
                state.last_round_trip = Some(push.elapsed());
            }
            (push, state.channels.get(&envelope.topic).cloned())
        };
        let rtt = push.as_ref().map(Push::elapsed);

        if envelope.topic == PHOENIX_TOPIC {
            debug!(
                target: HEARTBEAT_TARGET,
                reference = %envelope.reference,
                rtt_ms = rtt.map(|d| d.as_millis() as u64),
                "R_Heartbeat"
            );
            let hook = self.hooks.lock().on_received_heartbeat.clone();
            if let Some(hook) = hook {
                hook();
            }
        } else {
            debug!(topic = %envelope.topic, event = %envelope.event, "Received");
        }

        if let Some(push) = push {
            if let Some(rtt) = rtt {
                let _ = self.rtt_tx.send(rtt);
            }
            push.handle_response(&envelope);
        }

        if let Some(channel) = channel {
            channel.received(&envelope);
        }
    }

    fn heartbeat_tick(self: &Arc<Self>) {
        if !self.state.lock().connected {
            return;
        }

        self.send(Push::heartbeat());

        let hook = self.hooks.lock().on_sending_heartbeat.clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

async fn run_event_loop(
    socket: Weak<SocketInner>,
    mut events: EventReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        let Some(inner) = socket.upgrade() else {
            break;
        };
        inner.handle_event(event);
    }
    debug!("Event loop stopped");
}

async fn run_writer(
    transport: Arc<dyn Transport>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    shutdown: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = shutdown.cancelled() => break,
            data = frames.recv() => data,
        };
        let Some(data) = data else {
            break;
        };
        if let Err(e) = transport.write(data).await {
            warn!(error = %e, "Write failed");
        }
    }
    debug!("Writer stopped");
}

async fn run_heartbeat(socket: Weak<SocketInner>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = socket.upgrade() else {
            break;
        };
        inner.heartbeat_tick();
    }
    debug!(target: HEARTBEAT_TARGET, "Heartbeat loop stopped");
}
