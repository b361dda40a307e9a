//! Client configuration.

use crate::connection::ReconnectPolicy;
use herald_protocol::Encoding;
use herald_transport::{Endpoint, TransportKind, TransportOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field is empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// A duration is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// A duration is beyond [`MAX_DURATION_MS`].
    #[error("{0} must not exceed one day")]
    TooLarge(&'static str),
}

/// Upper bound of every configured duration: one day.
pub const MAX_DURATION_MS: u64 = 86_400_000;

/// Domain under which cluster hosts live.
pub const CLUSTER_DOMAIN: &str = "herald.io";

/// Host used when neither a host nor a cluster is configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Application key identifying the app on the service.
    #[serde(default)]
    pub app_key: String,

    /// Service host. Takes precedence over `cluster`.
    #[serde(default)]
    pub host: Option<String>,

    /// Service cluster; selects the host `ws-{cluster}.herald.io`.
    #[serde(default)]
    pub cluster: Option<String>,

    /// Port for unencrypted transports.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// Port for encrypted transports.
    #[serde(default = "default_wss_port")]
    pub wss_port: u16,

    /// Path prefix of the HTTP transports.
    #[serde(default = "default_http_path")]
    pub http_path: String,

    /// Only use encrypted transports.
    #[serde(default = "default_true")]
    pub encryption_required: bool,

    /// Transport families in priority order.
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,

    /// Time one transport gets to open and complete the handshake.
    #[serde(default = "default_transport_timeout")]
    pub transport_timeout_ms: u64,

    /// Attempts per cycle before giving up; zero means one per candidate.
    #[serde(default)]
    pub max_attempts_per_cycle: usize,

    /// Candidate ordering after a transport failure.
    #[serde(default)]
    pub reconnect_policy: ReconnectPolicy,

    /// Inactivity before the client pings the service.
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout_ms: u64,

    /// Time the service gets to answer a ping.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,

    /// Delay of a reconnect the service asked for.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    /// Encoding for binary-capable transports.
    #[serde(default)]
    pub encoding: Encoding,

    /// Pause between polls that returned no messages.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum number of channels.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Endpoint of the HTTP authorizer for protected channels.
    #[serde(default)]
    pub auth_endpoint: Option<String>,
}

fn default_ws_port() -> u16 {
    80
}

fn default_wss_port() -> u16 {
    443
}

fn default_http_path() -> String {
    "/herald".to_string()
}

fn default_true() -> bool {
    true
}

fn default_transports() -> Vec<TransportKind> {
    TransportKind::DEFAULT_PRIORITY.to_vec()
}

fn default_transport_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_activity_timeout() -> u64 {
    120_000 // 2 minutes
}

fn default_pong_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_reconnect_backoff() -> u64 {
    1_000
}

fn default_poll_interval() -> u64 {
    250
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_channels() -> usize {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            host: None,
            cluster: None,
            ws_port: default_ws_port(),
            wss_port: default_wss_port(),
            http_path: default_http_path(),
            encryption_required: true,
            transports: default_transports(),
            transport_timeout_ms: default_transport_timeout(),
            max_attempts_per_cycle: 0,
            reconnect_policy: ReconnectPolicy::default(),
            activity_timeout_ms: default_activity_timeout(),
            pong_timeout_ms: default_pong_timeout(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            encoding: Encoding::default(),
            poll_interval_ms: default_poll_interval(),
            max_message_size: default_max_message_size(),
            max_channels: default_max_channels(),
            auth_endpoint: None,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for `app_key` with defaults for everything else.
    #[must_use]
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            ..Self::default()
        }
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_key.is_empty() {
            return Err(ConfigError::Empty("app_key"));
        }
        if self.host.as_deref() == Some("") {
            return Err(ConfigError::Empty("host"));
        }
        if self.cluster.as_deref() == Some("") {
            return Err(ConfigError::Empty("cluster"));
        }
        if self.transports.is_empty() {
            return Err(ConfigError::Empty("transports"));
        }
        for (name, value) in [
            ("transport_timeout_ms", self.transport_timeout_ms),
            ("activity_timeout_ms", self.activity_timeout_ms),
            ("pong_timeout_ms", self.pong_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        for (name, value) in [
            ("transport_timeout_ms", self.transport_timeout_ms),
            ("activity_timeout_ms", self.activity_timeout_ms),
            ("pong_timeout_ms", self.pong_timeout_ms),
            ("reconnect_backoff_ms", self.reconnect_backoff_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ] {
            if value > MAX_DURATION_MS {
                return Err(ConfigError::TooLarge(name));
            }
        }
        Ok(())
    }

    /// Host to connect to: the explicit host, else the cluster host, else
    /// [`DEFAULT_HOST`].
    #[must_use]
    pub fn resolved_host(&self) -> String {
        match (&self.host, &self.cluster) {
            (Some(host), _) => host.clone(),
            (None, Some(cluster)) => format!("ws-{cluster}.{CLUSTER_DOMAIN}"),
            (None, None) => DEFAULT_HOST.to_string(),
        }
    }

    /// Service endpoint described by this configuration.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        let mut endpoint = Endpoint::new(self.app_key.clone(), self.resolved_host());
        endpoint.port = self.ws_port;
        endpoint.tls_port = self.wss_port;
        endpoint.http_path = self.http_path.clone();
        endpoint
    }

    /// Options for the built-in transports.
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            encoding: self.encoding,
            max_message_size: self.max_message_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..TransportOptions::default()
        }
    }

    /// Per-transport timeout.
    #[must_use]
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    /// Inactivity before pinging.
    #[must_use]
    pub fn activity_timeout(&self) -> Duration {
        Duration::from_millis(self.activity_timeout_ms)
    }

    /// Time allowed for a pong.
    #[must_use]
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    /// Delay of a service-requested reconnect.
    #[must_use]
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}
