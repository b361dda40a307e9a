//! Inbound frame dispatch.
//!
//! Reserved connection-management frames are classified first and handed
//! back to the driver. Every other frame is routed by its channel to that
//! channel's handlers, in binding order.

use crate::channel::{lock, Channel, HandlerId, HandlerTable};
use crate::metrics::{self, Direction};
use crate::registry::ChannelRegistry;
use herald_protocol::{codec, events, ConnectionEstablished, ErrorData, Frame, FrameKind, WireMessage};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Handler receiving every channel event as `(channel, event, data)`.
pub type GlobalHandler = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// What the dispatcher did with a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Handshake frame; the connection must act on it.
    Established(ConnectionEstablished),
    /// Connection-scoped error.
    Error(ErrorData),
    /// Keepalive request from the service.
    Ping,
    /// Keepalive response.
    Pong,
    /// Delivered to this many handlers.
    Delivered(usize),
    /// Not delivered anywhere.
    Dropped,
}

/// Routes inbound frames to handlers.
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    connection: Mutex<HandlerTable>,
    global: Mutex<Vec<(HandlerId, GlobalHandler)>>,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    #[must_use]
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            connection: Mutex::new(HandlerTable::new()),
            global: Mutex::new(Vec::new()),
        }
    }

    /// The registry frames are routed into.
    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Bind a handler to a connection-scoped event.
    pub fn bind_connection<F>(&self, event: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        lock(&self.connection).bind(event, Arc::new(handler))
    }

    /// Remove a connection-scoped handler.
    pub fn unbind_connection(&self, event: &str, id: HandlerId) -> bool {
        lock(&self.connection).unbind(event, id)
    }

    /// Bind a handler receiving every channel event.
    pub fn bind_global<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str, &str, &Value) + Send + Sync + 'static,
    {
        let id = HandlerId::next();
        lock(&self.global).push((id, Arc::new(handler)));
        id
    }

    /// Remove a global handler.
    pub fn unbind_global(&self, id: HandlerId) -> bool {
        let mut global = lock(&self.global);
        let before = global.len();
        global.retain(|(bound, _)| *bound != id);
        global.len() != before
    }

    /// Remove every connection-scoped and global handler.
    pub fn clear(&self) {
        lock(&self.connection).clear();
        lock(&self.global).clear();
    }

    /// Decode a wire message, dropping it if it is malformed.
    pub fn decode(&self, message: &WireMessage) -> Option<Frame> {
        metrics::record_frame(Direction::Inbound);
        match codec::decode(message) {
            Ok(frame) => {
                trace!(event = %frame.event, channel = ?frame.channel, "Frame received");
                Some(frame)
            }
            Err(e) => {
                warn!(error = %e, len = message.len(), "Dropping undecodable frame");
                metrics::record_dropped("protocol");
                None
            }
        }
    }

    /// Dispatch one decoded frame.
    pub fn dispatch(&self, frame: Frame) -> Dispatch {
        match frame.kind() {
            FrameKind::ConnectionEstablished => match frame.connection_established_data() {
                Some(established) => Dispatch::Established(established),
                None => {
                    warn!("Dropping malformed handshake frame");
                    metrics::record_dropped("protocol");
                    Dispatch::Dropped
                }
            },
            FrameKind::Error => Dispatch::Error(frame.error_data()),
            FrameKind::Ping => Dispatch::Ping,
            FrameKind::Pong => Dispatch::Pong,
            FrameKind::Subscribe | FrameKind::Unsubscribe => {
                debug!(event = %frame.event, "Ignoring client-only frame from service");
                metrics::record_dropped("unexpected");
                Dispatch::Dropped
            }
            FrameKind::SubscriptionSucceeded => self.route(frame, |channel| {
                if channel.acknowledge() {
                    Some(events::SUBSCRIPTION_SUCCEEDED)
                } else {
                    debug!(channel = %channel.name(), "Unsolicited acknowledgement");
                    None
                }
            }),
            FrameKind::SubscriptionError => self.route(frame, |channel| {
                channel.reject();
                Some(events::SUBSCRIPTION_ERROR)
            }),
            FrameKind::Event => {
                if frame.event.starts_with(events::INTERNAL_PREFIX) {
                    debug!(event = %frame.event, "Ignoring internal event");
                    metrics::record_dropped("internal");
                    return Dispatch::Dropped;
                }
                if frame.channel.is_none() {
                    return Dispatch::Delivered(self.emit_connection(&frame.event, &frame.data));
                }
                self.route(frame, |_| None)
            }
        }
    }

    /// Route a channel-scoped frame.
    ///
    /// `prepare` may rename the event for handlers; returning `None` keeps
    /// the wire name, unless the frame is a reserved one, which is dropped.
    fn route<F>(&self, frame: Frame, prepare: F) -> Dispatch
    where
        F: FnOnce(&Channel) -> Option<&'static str>,
    {
        let Some(name) = frame.channel.as_deref() else {
            debug!(event = %frame.event, "Dropping channel frame without channel");
            metrics::record_dropped("no_channel");
            return Dispatch::Dropped;
        };
        let Some(channel) = self.registry.get(name) else {
            trace!(channel = %name, event = %frame.event, "Dropping frame for unknown channel");
            metrics::record_dropped("unknown_channel");
            return Dispatch::Dropped;
        };

        let event = match prepare(channel.as_ref()) {
            Some(renamed) => renamed,
            None if frame.kind() == FrameKind::Event => frame.event.as_str(),
            None => return Dispatch::Dropped,
        };
        Dispatch::Delivered(self.emit_channel(&channel, event, &frame.data))
    }

    /// Invoke a channel's handlers and then the global handlers.
    pub(crate) fn emit_channel(&self, channel: &Channel, event: &str, data: &Value) -> usize {
        let delivered = channel.emit(event, data);
        let global: Vec<GlobalHandler> = lock(&self.global)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in &global {
            handler(channel.name(), event, data);
        }
        delivered + global.len()
    }

    /// Invoke the connection-scoped handlers for `event`.
    pub fn emit_connection(&self, event: &str, data: &Value) -> usize {
        let handlers = lock(&self.connection).handlers_for(event);
        for handler in &handlers {
            handler(data);
        }
        handlers.len()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("channels", &self.registry.len())
            .field("connection", &*lock(&self.connection))
            .field("global", &lock(&self.global).len())
            .finish()
    }
}
