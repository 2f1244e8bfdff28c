//! Session lifecycle for the Beacon client.
//!
//! This module wires the socket hooks, joins the configured channels on every
//! connect and keeps reconnecting while the socket is down.

use crate::config::{ChannelEntry, Config};
use crate::metrics;
use anyhow::{Context, Result};
use beacon_core::{Channel, ReceiveStatus, Socket};
use beacon_transport::WebSocketTransport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LEAVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared client state.
pub struct Session {
    socket: Socket,
    config: Config,
    channels: Mutex<Vec<Channel>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

/// Run the client until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the endpoint is invalid or the signal handler fails.
pub async fn run(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let transport = WebSocketTransport::new(config.transport_config())
        .with_context(|| format!("Invalid socket URL: {}", config.url))?;
    let socket = Socket::new(Arc::new(transport), config.socket_config());

    let session = Session::new(socket, config);
    session.install_hooks();
    session.spawn_round_trip_recorder();
    session.socket.connect();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    session.shutdown().await;

    Ok(())
}

impl Session {
    /// Create new session state.
    #[must_use]
    pub fn new(socket: Socket, config: Config) -> Arc<Self> {
        Arc::new(Self {
            socket,
            config,
            channels: Mutex::new(Vec::new()),
            reconnect: Mutex::new(None),
            closing: AtomicBool::new(false),
        })
    }

    fn install_hooks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.socket.on_connect(move || {
            if let Some(session) = weak.upgrade() {
                session.on_connected();
            }
        });

        let weak = Arc::downgrade(self);
        self.socket.on_disconnect(move |error| {
            match error {
                Some(e) => warn!(error = %e, "Socket disconnected"),
                None => info!("Socket disconnected"),
            }
            metrics::record_disconnection();
            if let Some(session) = weak.upgrade() {
                session.channels.lock().clear();
                session.start_reconnect();
            }
        });

        self.socket
            .on_sending_heartbeat(metrics::record_heartbeat_sent)
            .on_received_heartbeat(metrics::record_heartbeat_received);
    }

    fn on_connected(self: &Arc<Self>) {
        info!(url = %self.socket.url(), "Socket connected");
        metrics::record_connection();
        self.stop_reconnect();

        let channels: Vec<Channel> = self
            .config
            .channels
            .iter()
            .map(|entry| self.join(entry))
            .collect();
        *self.channels.lock() = channels;
    }

    fn join(&self, entry: &ChannelEntry) -> Channel {
        let channel = self.socket.channel(entry.topic.clone(), entry.params.clone());

        for event in &entry.events {
            let topic = entry.topic.clone();
            channel.on(event.clone(), move |envelope| {
                metrics::record_event(&topic, &envelope.event);
                info!(
                    topic = %topic,
                    event = %envelope.event,
                    payload = %serde_json::Value::Object(envelope.payload.clone()),
                    "Event"
                );
            });
        }

        let topic = entry.topic.clone();
        channel.on_presence_join(move |id, _| info!(topic = %topic, id, "Presence join"));
        let topic = entry.topic.clone();
        channel.on_presence_leave(move |id, _| info!(topic = %topic, id, "Presence leave"));
        let topic = entry.topic.clone();
        channel.on_presence_state_change(move |state| {
            debug!(topic = %topic, members = state.len(), "Presence changed");
            metrics::set_presence_members(&topic, state.len());
        });

        let push = channel.join();
        let topic = entry.topic.clone();
        push.receive(ReceiveStatus::Ok, move |_| info!(topic = %topic, "Joined"));
        let topic = entry.topic.clone();
        push.receive(ReceiveStatus::Error, move |payload| {
            let reason = beacon_protocol::envelope::error_reason(payload)
                .unwrap_or(beacon_core::reply::JOIN_REJECTED);
            warn!(topic = %topic, reason, "Join failed");
            metrics::record_error("join");
        });

        channel
    }

    fn start_reconnect(self: &Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.reconnect.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let period = self.config.reconnect_interval();
        info!(?period, "Starting reconnect poll");
        *slot = Some(tokio::spawn(reconnect_poll(Arc::downgrade(self), period)));
    }

    fn stop_reconnect(&self) {
        if let Some(task) = self.reconnect.lock().take() {
            task.abort();
        }
    }

    fn spawn_round_trip_recorder(&self) {
        let mut samples = self.socket.round_trip_times();
        tokio::spawn(async move {
            loop {
                match samples.recv().await {
                    Ok(rtt) => metrics::record_round_trip(rtt),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Round trip samples lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Leave every channel, then close the socket.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.stop_reconnect();

        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            let reply = channel.leave().reply();
            if tokio::time::timeout(LEAVE_TIMEOUT, reply).await.is_err() {
                debug!(topic = %channel.topic(), "Leave not acknowledged");
            }
        }

        self.socket.disconnect();
        self.socket.shutdown();
    }
}

async fn reconnect_poll(session: Weak<Session>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(session) = session.upgrade() else {
            break;
        };
        if session.socket.is_connected() {
            break;
        }
        if !session.socket.is_connecting() {
            info!("Reconnecting");
            session.socket.connect();
        }
    }
}
