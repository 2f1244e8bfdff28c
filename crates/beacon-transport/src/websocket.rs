//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::WebSocketConfig as WsConfig, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::traits::{EventSender, Transport, TransportError, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Close code reported when the client tears the connection down itself.
const CLIENT_CLOSE_CODE: i32 = 1000;

/// Close code reported when the stream ends without a close frame.
const ABNORMAL_CLOSE_CODE: i32 = 1006;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Endpoint URL (`ws://` or `wss://`).
    pub url: String,
    /// Opaque token appended as the `token` query parameter.
    pub token: Option<String>,
    /// Upper bound on establishing the connection.
    pub connect_timeout: Duration,
    /// Maximum inbound message size in bytes. A larger message ends the
    /// connection with a receive failure.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4000/socket/websocket".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(5),
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// State shared between the transport handle and its connection task.
///
/// The sink is tagged with the generation of the connection that owns it.
#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    generation: AtomicU64,
    sink: tokio::sync::Mutex<Option<(u64, WsSink)>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    events: parking_lot::Mutex<Option<EventSender>>,
}

/// WebSocket client transport.
pub struct WebSocketTransport {
    url: String,
    config: WebSocketConfig,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.config.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not a `ws://` or `wss://` URL.
    pub fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let url = build_url(&config.url, config.token.as_deref())?;

        info!(url = %config.url, "WebSocket transport configured");

        Ok(Self {
            url,
            config,
            shared: Arc::new(Shared::default()),
        })
    }

    /// Create a transport for a URL with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn with_url(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            url: url.into(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn connect(&self, events: EventSender) {
        if self.is_connected() {
            debug!("WebSocket already connected");
            return;
        }

        if let Some(previous) = self.shared.task.lock().take() {
            previous.abort();
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::clone(&self.shared);
        let url = self.url.clone();
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            run_connection(shared, generation, url, config, events).await;
        });
        *self.shared.task.lock() = Some(task);
    }

    fn disconnect(&self) {
        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }

        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(events) = self.shared.events.lock().take() {
            let _ = events.send(TransportEvent::Disconnected(Some(
                TransportError::Disconnection {
                    reason: "Disconnected by client".to_string(),
                    code: CLIENT_CLOSE_CODE,
                },
            )));
        }

        let generation = self.shared.generation.load(Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Some(mut sink) = take_sink(&shared, generation).await {
                    if let Err(e) = sink.close().await {
                        debug!("Failed to close WebSocket cleanly: {}", e);
                    }
                }
            });
        }
    }

    async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        let text = String::from_utf8(data.to_vec())
            .map_err(|e| TransportError::SendFailed(format!("Frame is not UTF-8: {}", e)))?;

        let mut slot = self.shared.sink.lock().await;
        let (_, sink) = slot.as_mut().ok_or(TransportError::ConnectionClosed)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn url(&self) -> &str {
        &self.config.url
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Establish the connection and pump inbound frames until it ends.
async fn run_connection(
    shared: Arc<Shared>,
    generation: u64,
    url: String,
    config: WebSocketConfig,
    events: EventSender,
) {
    let mut ws_config = WsConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);
    ws_config.max_frame_size = Some(config.max_message_size);

    let connect = connect_async_with_config(url.as_str(), Some(ws_config), false);
    let stream = match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!("WebSocket connect failed: {}", e);
            let _ = events.send(TransportEvent::Disconnected(Some(connect_error(&e))));
            return;
        }
        Err(_) => {
            warn!(timeout = ?config.connect_timeout, "WebSocket connect timed out");
            let _ = events.send(TransportEvent::Disconnected(Some(TransportError::Timeout)));
            return;
        }
    };

    let (sink, mut stream) = stream.split();
    *shared.sink.lock().await = Some((generation, sink));
    *shared.events.lock() = Some(events.clone());
    shared.connected.store(true, Ordering::SeqCst);

    debug!(url = %config.url, "WebSocket connected");
    let _ = events.send(TransportEvent::Connected);

    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let _ = events.send(TransportEvent::Message(text));
            }
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => {
                    let _ = events.send(TransportEvent::Message(text));
                }
                Err(_) => warn!("Dropping non UTF-8 binary frame"),
            },
            Some(Ok(Message::Ping(data))) => {
                let mut slot = shared.sink.lock().await;
                if let Some((_, sink)) = slot.as_mut() {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
            }
            Some(Ok(Message::Pong(_))) => {
                // Ignore pong messages
            }
            Some(Ok(Message::Close(frame))) => {
                debug!("Received close frame");
                let (reason, code) = frame
                    .map(|f| (f.reason.to_string(), i32::from(u16::from(f.code))))
                    .unwrap_or_else(|| ("Disconnected".to_string(), ABNORMAL_CLOSE_CODE));
                break TransportError::Disconnection { reason, code };
            }
            Some(Ok(Message::Frame(_))) => {
                // Raw frame, ignore
            }
            Some(Err(WsError::ConnectionClosed)) => {
                debug!("Connection closed");
                break TransportError::Disconnection {
                    reason: "Connection closed".to_string(),
                    code: ABNORMAL_CLOSE_CODE,
                };
            }
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                break TransportError::ReceiveFailure {
                    reason: e.to_string(),
                    code: error_code(&e),
                };
            }
            None => {
                debug!("WebSocket stream ended");
                break TransportError::Disconnection {
                    reason: "Stream ended".to_string(),
                    code: ABNORMAL_CLOSE_CODE,
                };
            }
        }
    };

    if shared.connected.swap(false, Ordering::SeqCst) {
        take_sink(&shared, generation).await;
        shared.events.lock().take();
        let _ = events.send(TransportEvent::Disconnected(Some(reason)));
    }
}

/// Remove the sink if it still belongs to `generation`.
async fn take_sink(shared: &Shared, generation: u64) -> Option<WsSink> {
    let mut slot = shared.sink.lock().await;
    let owned = matches!(slot.as_ref(), Some((owner, _)) if *owner == generation);
    if owned {
        slot.take().map(|(_, sink)| sink)
    } else {
        None
    }
}

fn connect_error(e: &WsError) -> TransportError {
    match e {
        WsError::Url(url) => TransportError::InvalidUrl(url.to_string()),
        other => TransportError::Disconnection {
            reason: other.to_string(),
            code: error_code(other),
        },
    }
}

fn error_code(e: &WsError) -> i32 {
    match e {
        WsError::Io(io) => io.raw_os_error().unwrap_or(0),
        _ => 0,
    }
}

/// Build the connection URL, appending the token as a query parameter.
fn build_url(url: &str, token: Option<&str>) -> Result<String, TransportError> {
    let mut parsed =
        Url::parse(url).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", e, url)))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(TransportError::InvalidUrl(format!(
            "expected ws:// or wss:// scheme: {}",
            url
        )));
    }

    let Some(token) = token else {
        return Ok(url.to_string());
    };

    parsed.query_pairs_mut().append_pair("token", token);
    Ok(parsed.to_string())
}
