//! Transport abstraction traits for Herald.
//!
//! A [`Transport`] knows how to open a [`Connection`] to the service; the
//! connection then carries [`WireMessage`]s in both directions until either
//! side closes it. The client never depends on a concrete transport.

use async_trait::async_trait;
use herald_protocol::{Encoding, WireMessage, PROTOCOL_VERSION};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier of an HTTP transport session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a session ID unique within this process.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{:x}{:04x}", timestamp, counter & 0xffff))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the service lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Application key identifying the tenant.
    pub app_key: String,
    /// Host name.
    pub host: String,
    /// Port for plain connections.
    pub port: u16,
    /// Port for TLS connections.
    pub tls_port: u16,
    /// Path prefix for HTTP transports.
    pub http_path: String,
    /// Client version announced to the service.
    pub client_version: String,
}

impl Endpoint {
    /// Create an endpoint with the default ports and paths.
    #[must_use]
    pub fn new(app_key: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            host: host.into(),
            port: 80,
            tls_port: 443,
            http_path: "/herald".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn authority(&self, tls: bool) -> String {
        let port = if tls { self.tls_port } else { self.port };
        format!("{}:{}", self.host, port)
    }

    /// URL for socket transports.
    #[must_use]
    pub fn socket_url(&self, tls: bool) -> String {
        let scheme = if tls { "wss" } else { "ws" };
        format!(
            "{}://{}/app/{}?{}",
            scheme,
            self.authority(tls),
            self.app_key,
            PROTOCOL_VERSION.query(&self.client_version)
        )
    }

    /// Base URL for HTTP transports; session paths are appended to it.
    #[must_use]
    pub fn http_base(&self, tls: bool) -> String {
        let scheme = if tls { "https" } else { "http" };
        format!(
            "{}://{}{}/app/{}",
            scheme,
            self.authority(tls),
            self.http_path.trim_end_matches('/'),
            self.app_key
        )
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The service or network refused the connection.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] herald_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A mechanism able to open connections to the service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to the endpoint.
    ///
    /// Resolves once the transport is usable; the service handshake frame
    /// arrives afterwards through [`Connection::recv`].
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "ws", "xhr_streaming").
    fn name(&self) -> &'static str;
}

/// An open connection over a transport.
///
/// `recv` must be cancel-safe: the client races it against outbound traffic.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next message.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError>;

    /// Send a message.
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;

    /// Encoding outbound frames must use.
    fn encoding(&self) -> Encoding {
        Encoding::Json
    }
}
