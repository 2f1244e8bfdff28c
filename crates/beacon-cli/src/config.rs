//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BEACON_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use beacon_core::{
    ChannelConfig, DiffNotify, PendingPushPolicy, PresenceConfig, SnapshotPolicy, SocketConfig,
    TransitionPolicy,
};
use beacon_protocol::Payload;
use beacon_transport::WebSocketConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Socket endpoint.
    #[serde(default = "default_url")]
    pub url: String,

    /// Auth token sent as the `token` query parameter.
    #[serde(default = "default_token")]
    pub token: Option<String>,

    /// Socket name used in logs and errors.
    #[serde(default = "default_name")]
    pub name: String,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Reconnect configuration.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Socket and channel policies.
    #[serde(default)]
    pub policies: PolicyConfig,

    /// Channels joined on every connect.
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Unanswered heartbeats tolerated before disconnecting.
    #[serde(default = "default_failure_tolerance")]
    pub failure_tolerance: Option<usize>,
}

/// Reconnect configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// How often a dropped socket tries to connect again, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Delay before a stalled connect attempt is retried, in milliseconds.
    #[serde(default = "default_connect_retry")]
    pub connect_retry_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Socket and channel policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Pushes awaiting a reply when the connection drops.
    #[serde(default)]
    pub pending_pushes: PendingPushPolicy,

    /// Join and leave from an unexpected state.
    #[serde(default)]
    pub transitions: TransitionPolicy,

    /// Ids missing from a presence snapshot.
    #[serde(default)]
    pub snapshot: SnapshotPolicy,

    /// When a presence diff notifies observers.
    #[serde(default)]
    pub diff_notify: DiffNotify,
}

/// A channel to join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// Topic name.
    pub topic: String,

    /// Join parameters.
    #[serde(default)]
    pub params: Payload,

    /// Events logged when they arrive.
    #[serde(default)]
    pub events: Vec<String>,
}

// Default value functions
fn default_url() -> String {
    std::env::var("BEACON_URL")
        .unwrap_or_else(|_| "ws://127.0.0.1:4000/socket/websocket".to_string())
}

fn default_token() -> Option<String> {
    std::env::var("BEACON_TOKEN").ok().filter(|t| !t.is_empty())
}

fn default_name() -> String {
    "Beacon".to_string()
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

fn default_failure_tolerance() -> Option<usize> {
    Some(2)
}

fn default_poll_interval() -> u64 {
    5_000
}

fn default_connect_retry() -> u64 {
    3_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: default_token(),
            name: default_name(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            metrics: MetricsConfig::default(),
            policies: PolicyConfig::default(),
            channels: Vec::new(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            failure_tolerance: default_failure_tolerance(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            connect_retry_ms: default_connect_retry(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// `BEACON_CONFIG` names an explicit file; otherwise the default paths
    /// are searched.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("BEACON_CONFIG") {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        let config_paths = [
            "beacon.toml",
            "/etc/beacon/beacon.toml",
            "~/.config/beacon/beacon.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Transport settings.
    #[must_use]
    pub fn transport_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            url: self.url.clone(),
            token: self.token.clone(),
            ..WebSocketConfig::default()
        }
    }

    /// Socket settings.
    #[must_use]
    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            name: self.name.clone(),
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            connect_retry_delay: Duration::from_millis(self.reconnect.connect_retry_ms),
            heartbeat_failure_tolerance: self.heartbeat.failure_tolerance,
            pending_pushes: self.policies.pending_pushes,
            channel: ChannelConfig {
                transitions: self.policies.transitions,
                presence: PresenceConfig {
                    snapshot: self.policies.snapshot,
                    diff_notify: self.policies.diff_notify,
                },
            },
            ..SocketConfig::default()
        }
    }

    /// Reconnect poll period.
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.name, "Beacon");
        assert_eq!(config.heartbeat.interval_ms, 5_000);
        assert_eq!(config.heartbeat.failure_tolerance, Some(2));
        assert_eq!(config.reconnect.poll_interval_ms, 5_000);
        assert!(!config.metrics.enabled);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn test_socket_config() {
        let config = Config::default();
        let socket = config.socket_config();
        assert_eq!(socket.name, "Beacon");
        assert_eq!(socket.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(socket.connect_retry_delay, Duration::from_secs(3));
        assert_eq!(socket.heartbeat_failure_tolerance, Some(2));
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            url = "wss://chat.example.com/socket/websocket"
            token = "abc"
            name = "CrowdChat"

            [heartbeat]
            interval_ms = 10000

            [metrics]
            enabled = true

            [[channels]]
            topic = "chat_room:lobby"
            events = ["new_msg"]

            [channels.params]
            nickname = "ann"
            age = 30

            [[channels]]
            topic = "chat_room:other"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.url, "wss://chat.example.com/socket/websocket");
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert_eq!(config.name, "CrowdChat");
        assert_eq!(config.heartbeat.interval_ms, 10_000);
        assert_eq!(config.heartbeat.failure_tolerance, Some(2));
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);

        assert_eq!(config.channels.len(), 2);
        let lobby = &config.channels[0];
        assert_eq!(lobby.topic, "chat_room:lobby");
        assert_eq!(lobby.events, vec!["new_msg"]);
        assert_eq!(lobby.params["nickname"], json!("ann"));
        assert_eq!(lobby.params["age"], json!(30));
        assert!(config.channels[1].params.is_empty());
    }

    #[test]
    fn test_policies_from_toml() {
        let config: Config = toml::from_str(
            r#"
            [policies]
            pending_pushes = "fail"
            transitions = "strict"
            snapshot = "replace"
        "#,
        )
        .unwrap();

        let socket = config.socket_config();
        assert_eq!(socket.pending_pushes, PendingPushPolicy::Fail);
        assert_eq!(socket.channel.transitions, TransitionPolicy::Strict);
        assert_eq!(socket.channel.presence.snapshot, SnapshotPolicy::Replace);
        assert_eq!(socket.channel.presence.diff_notify, DiffNotify::OnCountChange);

        let defaults = Config::default().socket_config();
        assert_eq!(defaults.pending_pushes, PendingPushPolicy::Drop);
        assert_eq!(defaults.channel, ChannelConfig::default());
    }

    #[test]
    fn test_policy_names_are_snake_case() {
        let ok = toml::from_str::<Config>("[policies]\ndiff_notify = \"on_count_change\"");
        assert!(ok.is_ok());
        let err = toml::from_str::<Config>("[policies]\ndiff_notify = \"OnCountChange\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_transport_config() {
        let config: Config = toml::from_str(
            r#"
            url = "ws://localhost:4000/socket/websocket"
            token = "t"
        "#,
        )
        .unwrap();
        let transport = config.transport_config();
        assert_eq!(transport.url, "ws://localhost:4000/socket/websocket");
        assert_eq!(transport.token.as_deref(), Some("t"));
    }
}
