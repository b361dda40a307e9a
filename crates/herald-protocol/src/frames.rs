//! Frame types for the Herald protocol.
//!
//! Every message exchanged with the service is a [`Frame`]: an event name,
//! an optional channel and an arbitrary structured payload. Event names with
//! the `herald:` or `herald_internal:` prefix are reserved for connection
//! management and the subscription handshake.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Reserved event names.
pub mod events {
    /// Handshake sent by the service once a transport is usable.
    pub const CONNECTION_ESTABLISHED: &str = "herald:connection_established";
    /// Channel-scoped acknowledgement of a subscribe request (wire name).
    pub const SUBSCRIPTION_SUCCEEDED_INTERNAL: &str = "herald_internal:subscription_succeeded";
    /// Name under which the acknowledgement is surfaced to channel handlers.
    pub const SUBSCRIPTION_SUCCEEDED: &str = "herald:subscription_succeeded";
    /// Channel-scoped subscription failure.
    pub const SUBSCRIPTION_ERROR: &str = "herald:subscription_error";
    /// Connection-scoped error.
    pub const ERROR: &str = "herald:error";
    /// Keepalive request.
    pub const PING: &str = "herald:ping";
    /// Keepalive response.
    pub const PONG: &str = "herald:pong";
    /// Client request to join a channel.
    pub const SUBSCRIBE: &str = "herald:subscribe";
    /// Client request to leave a channel.
    pub const UNSUBSCRIBE: &str = "herald:unsubscribe";

    /// Prefix of events that never reach user handlers under their wire name.
    pub const INTERNAL_PREFIX: &str = "herald_internal:";
    /// Prefix required for events triggered by clients.
    pub const CLIENT_EVENT_PREFIX: &str = "client-";
}

/// Classification of a frame by its event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    ConnectionEstablished,
    SubscriptionSucceeded,
    SubscriptionError,
    Error,
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    /// Any non-reserved event, routed by channel.
    Event,
}

impl FrameKind {
    /// Classify an event name.
    #[must_use]
    pub fn from_event(event: &str) -> Self {
        match event {
            events::CONNECTION_ESTABLISHED => FrameKind::ConnectionEstablished,
            events::SUBSCRIPTION_SUCCEEDED_INTERNAL => FrameKind::SubscriptionSucceeded,
            events::SUBSCRIPTION_ERROR => FrameKind::SubscriptionError,
            events::ERROR => FrameKind::Error,
            events::PING => FrameKind::Ping,
            events::PONG => FrameKind::Pong,
            events::SUBSCRIBE => FrameKind::Subscribe,
            events::UNSUBSCRIBE => FrameKind::Unsubscribe,
            _ => FrameKind::Event,
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Event name.
    pub event: String,
    /// Channel the event is scoped to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Payload of `herald:connection_established`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    /// Identifier the service assigned to this connection.
    pub socket_id: String,
    /// Inactivity period (seconds) after which the client should ping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_timeout: Option<u64>,
}

/// Payload of `herald:error` and `herald:subscription_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Service error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Credentials attached to a subscribe frame for protected channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    /// Signed token.
    pub auth: String,
    /// Extra data the auth endpoint wants forwarded to the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

impl Frame {
    /// Create a frame with an arbitrary event.
    #[must_use]
    pub fn new(event: impl Into<String>, channel: Option<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel,
            data,
        }
    }

    /// Classify this frame.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        FrameKind::from_event(&self.event)
    }

    /// Create a subscribe request.
    #[must_use]
    pub fn subscribe(channel: &str, auth: Option<&AuthToken>) -> Self {
        let mut data = json!({ "channel": channel });
        if let Some(token) = auth {
            data["auth"] = Value::String(token.auth.clone());
            if let Some(channel_data) = &token.channel_data {
                data["channel_data"] = Value::String(channel_data.clone());
            }
        }
        Self::new(events::SUBSCRIBE, None, data)
    }

    /// Create an unsubscribe request.
    #[must_use]
    pub fn unsubscribe(channel: &str) -> Self {
        Self::new(events::UNSUBSCRIBE, None, json!({ "channel": channel }))
    }

    /// Create a keepalive ping.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(events::PING, None, json!({}))
    }

    /// Create a keepalive pong.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(events::PONG, None, json!({}))
    }

    /// Create a client-triggered channel event.
    #[must_use]
    pub fn client_event(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self::new(event, Some(channel.into()), data)
    }

    /// Create a connection handshake frame.
    #[must_use]
    pub fn connection_established(socket_id: impl Into<String>, activity_timeout: Option<u64>) -> Self {
        let payload = ConnectionEstablished {
            socket_id: socket_id.into(),
            activity_timeout,
        };
        Self::new(
            events::CONNECTION_ESTABLISHED,
            None,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }

    /// Create a subscription acknowledgement.
    #[must_use]
    pub fn subscription_succeeded(channel: impl Into<String>, data: Value) -> Self {
        Self::new(
            events::SUBSCRIPTION_SUCCEEDED_INTERNAL,
            Some(channel.into()),
            data,
        )
    }

    /// Create a subscription failure.
    #[must_use]
    pub fn subscription_error(channel: impl Into<String>, code: Option<u16>, message: impl Into<String>) -> Self {
        Self::new(
            events::SUBSCRIPTION_ERROR,
            Some(channel.into()),
            json!({ "code": code, "message": message.into() }),
        )
    }

    /// Create a connection-scoped error.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::new(
            events::ERROR,
            None,
            json!({ "code": code, "message": message.into() }),
        )
    }

    /// Channel named inside the payload of a subscribe/unsubscribe request.
    #[must_use]
    pub fn target_channel(&self) -> Option<&str> {
        self.channel
            .as_deref()
            .or_else(|| self.data.get("channel").and_then(Value::as_str))
    }

    /// Parse the handshake payload.
    #[must_use]
    pub fn connection_established_data(&self) -> Option<ConnectionEstablished> {
        serde_json::from_value(self.data.clone()).ok()
    }

    /// Parse an error payload.
    ///
    /// Services are not consistent about error shapes, so a bare string is
    /// accepted as the message.
    #[must_use]
    pub fn error_data(&self) -> ErrorData {
        match &self.data {
            Value::String(message) => ErrorData {
                code: None,
                message: message.clone(),
            },
            other => serde_json::from_value(other.clone()).unwrap_or(ErrorData {
                code: None,
                message: other.to_string(),
            }),
        }
    }
}

/// Whether subscribing to `channel` requires an auth token.
#[must_use]
pub fn requires_auth(channel: &str) -> bool {
    channel.starts_with("private-") || channel.starts_with("presence-")
}
