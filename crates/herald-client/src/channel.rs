//! Channel abstraction for Herald.
//!
//! A [`Channel`] is a named topic the client subscribes to. It carries the
//! subscription state and the event handlers bound to it. Handlers belong to
//! the channel object itself, so they survive resubscription after a
//! reconnect.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 164;

/// A channel identifier.
pub type ChannelId = String;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-=@,.;:".contains(c))
    {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscription state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Requested but not acknowledged by the service.
    Pending,
    /// Acknowledged by the service.
    Subscribed,
    /// Removed by the caller; receives nothing further.
    Unsubscribed,
}

/// Progress of the subscribe request for a pending channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestPhase {
    /// Nothing sent on the current connection.
    Idle,
    /// Waiting for the authorizer.
    Authorizing,
    /// Subscribe frame sent, waiting for the acknowledgement.
    Sent,
}

/// Opaque token identifying one bound handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

static HANDLER_COUNTER: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    pub(crate) fn next() -> Self {
        Self(HANDLER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An event handler.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handlers keyed by event name, in binding order.
#[derive(Clone, Default)]
pub struct HandlerTable {
    bindings: HashMap<String, Vec<(HandlerId, Handler)>>,
}

impl HandlerTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `event`.
    pub fn bind(&mut self, event: impl Into<String>, handler: Handler) -> HandlerId {
        let id = HandlerId::next();
        self.bindings
            .entry(event.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove the handler `id` from `event`. Returns `true` if it was bound.
    pub fn unbind(&mut self, event: &str, id: HandlerId) -> bool {
        let Some(handlers) = self.bindings.get_mut(event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(bound, _)| *bound != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.bindings.remove(event);
        }
        removed
    }

    /// Remove every handler for `event`.
    pub fn unbind_event(&mut self, event: &str) -> usize {
        self.bindings.remove(event).map_or(0, |h| h.len())
    }

    /// Remove every handler.
    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    /// Snapshot of the handlers for `event`, in binding order.
    #[must_use]
    pub fn handlers_for(&self, event: &str) -> Vec<Handler> {
        self.bindings
            .get(event)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Total number of bound handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }

    /// Whether no handler is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (event, handlers) in &self.bindings {
            map.entry(event, &handlers.len());
        }
        map.finish()
    }
}

#[derive(Debug)]
struct ChannelState {
    subscription: SubscriptionState,
    request: RequestPhase,
}

/// A subscribed (or subscribing) channel.
#[derive(Debug)]
pub struct Channel {
    name: ChannelId,
    /// Creation order within the registry, used to flush in request order.
    seq: u64,
    state: Mutex<ChannelState>,
    handlers: Mutex<HandlerTable>,
}

impl Channel {
    pub(crate) fn new(name: impl Into<ChannelId>, seq: u64) -> Self {
        Self {
            name: name.into(),
            seq,
            state: Mutex::new(ChannelState {
                subscription: SubscriptionState::Pending,
                request: RequestPhase::Idle,
            }),
            handlers: Mutex::new(HandlerTable::new()),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the subscription state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        lock(&self.state).subscription
    }

    /// Whether the service has acknowledged the subscription.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.state() == SubscriptionState::Subscribed
    }

    /// Bind a handler to `event`. Legal in any state.
    pub fn bind<F>(&self, event: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event = event.into();
        trace!(channel = %self.name, event = %event, "Binding handler");
        lock(&self.handlers).bind(event, Arc::new(handler))
    }

    /// Remove a previously bound handler. Returns `true` if it was bound.
    pub fn unbind(&self, event: &str, id: HandlerId) -> bool {
        lock(&self.handlers).unbind(event, id)
    }

    /// Remove every handler bound to `event`.
    pub fn unbind_event(&self, event: &str) -> usize {
        lock(&self.handlers).unbind_event(event)
    }

    /// Remove every handler.
    pub fn unbind_all(&self) {
        lock(&self.handlers).clear();
    }

    /// Number of bound handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Invoke the handlers for `event` in binding order.
    ///
    /// Handlers run against a snapshot, so binding or unbinding from inside a
    /// handler takes effect from the next event on. Returns how many ran.
    pub(crate) fn emit(&self, event: &str, data: &Value) -> usize {
        let handlers = lock(&self.handlers).handlers_for(event);
        for handler in &handlers {
            handler(data);
        }
        handlers.len()
    }

    /// Whether a subscribe request should be issued for this channel.
    pub(crate) fn needs_request(&self) -> bool {
        let state = lock(&self.state);
        state.subscription == SubscriptionState::Pending && state.request == RequestPhase::Idle
    }

    pub(crate) fn request_phase(&self) -> RequestPhase {
        lock(&self.state).request
    }

    pub(crate) fn set_request_phase(&self, phase: RequestPhase) {
        lock(&self.state).request = phase;
    }

    /// Apply an acknowledgement. Only a channel whose subscribe frame went
    /// out can become subscribed.
    pub(crate) fn acknowledge(&self) -> bool {
        let mut state = lock(&self.state);
        if state.subscription == SubscriptionState::Pending && state.request == RequestPhase::Sent {
            state.subscription = SubscriptionState::Subscribed;
            state.request = RequestPhase::Idle;
            debug!(channel = %self.name, "Subscribed");
            true
        } else {
            false
        }
    }

    /// The subscription attempt failed; the next connection retries it.
    pub(crate) fn reject(&self) {
        let mut state = lock(&self.state);
        if state.subscription == SubscriptionState::Pending {
            state.request = RequestPhase::Idle;
        }
    }

    /// The connection carrying the subscription is gone.
    pub(crate) fn reset(&self) {
        let mut state = lock(&self.state);
        if state.subscription != SubscriptionState::Unsubscribed {
            state.subscription = SubscriptionState::Pending;
            state.request = RequestPhase::Idle;
        }
    }

    pub(crate) fn mark_unsubscribed(&self) {
        let mut state = lock(&self.state);
        state.subscription = SubscriptionState::Unsubscribed;
        state.request = RequestPhase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("private-orders").is_ok());
        assert!(validate_channel_name("room:42;v=1").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("has space").is_err());
        assert!(validate_channel_name("$system").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[test]
    fn test_handlers_fire_in_binding_order() {
        let channel = Channel::new("orders", 0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            channel.bind("order_created", move |_| seen.lock().unwrap().push(tag));
        }

        assert_eq!(channel.emit("order_created", &json!({})), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(channel.emit("other", &json!({})), 0);
    }

    #[test]
    fn test_unbind_by_token() {
        let channel = Channel::new("orders", 0);
        let calls = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&calls);
        let keep = channel.bind("e", move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&calls);
        let drop_me = channel.bind("e", move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        assert!(channel.unbind("e", drop_me));
        assert!(!channel.unbind("e", drop_me));
        channel.emit("e", &Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(channel.unbind("e", keep));
        assert_eq!(channel.handler_count(), 0);
    }

    #[test]
    fn test_bind_during_emit_applies_to_next_event() {
        let channel = Arc::new(Channel::new("orders", 0));
        let calls = Arc::new(AtomicUsize::new(0));

        let inner_channel = Arc::clone(&channel);
        let inner_calls = Arc::clone(&calls);
        channel.bind("e", move |_| {
            let counter = Arc::clone(&inner_calls);
            inner_channel.bind("e", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(channel.emit("e", &Value::Null), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(channel.emit("e", &Value::Null), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acknowledge_requires_sent_request() {
        let channel = Channel::new("orders", 0);
        assert!(channel.needs_request());
        assert!(!channel.acknowledge());

        channel.set_request_phase(RequestPhase::Authorizing);
        assert!(!channel.needs_request());
        assert!(!channel.acknowledge());

        channel.set_request_phase(RequestPhase::Sent);
        assert!(channel.acknowledge());
        assert_eq!(channel.state(), SubscriptionState::Subscribed);

        channel.reset();
        assert_eq!(channel.state(), SubscriptionState::Pending);
        assert!(channel.needs_request());

        channel.mark_unsubscribed();
        channel.reset();
        assert_eq!(channel.state(), SubscriptionState::Unsubscribed);
    }
}
