//! The Herald client.
//!
//! [`Client`] is a cheap handle. All connection state lives in a driver task
//! that owns the [`ConnectionMachine`] and the current transport; handles talk
//! to it through a command queue, so calls made from inside handlers are
//! applied once the current dispatch has finished.

use crate::auth::{AuthError, Authorizer};
use crate::channel::{Channel, HandlerId, RequestPhase};
use crate::config::{ClientConfig, ConfigError};
use crate::connection::{AttemptId, ConnectionMachine, ConnectionState, CycleId, Effect};
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::metrics::{self, Direction};
use crate::registry::{ChannelRegistry, RegistryConfig, RegistryError};
use herald_protocol::{codec, events, requires_auth, AuthToken, ErrorData, Frame, WireMessage};
use herald_transport::{
    Candidate, CapabilityCache, Endpoint, Environment, Negotiator, TransportCatalog, TransportLoader,
};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

/// Local connection event fired on every state change, with data
/// `{ "previous", "current" }`. Never sent by the service.
pub const STATE_CHANGE: &str = "state_change";

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Channel registry refused the request.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Client events must carry the `client-` prefix.
    #[error("Invalid client event {0}: client events must start with \"client-\"")]
    InvalidEvent(String),

    /// Client events need a private or presence channel.
    #[error("Client events are only allowed on private and presence channels: {0}")]
    UnprotectedChannel(String),

    /// The channel is unknown or not yet acknowledged.
    #[error("Not subscribed to channel: {0}")]
    NotSubscribed(String),

    /// The driver task is gone.
    #[error("Client has shut down")]
    Closed,
}

/// Details of the current connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Transport currently attempted or in use.
    pub transport: Option<&'static str>,
    /// Socket id of the established connection.
    pub socket_id: Option<String>,
    /// Failed attempts since the last handshake.
    pub retry_count: u32,
}

enum Command {
    Connect,
    Disconnect,
    Subscribe(Arc<Channel>),
    Unsubscribe(String),
    Send(Frame),
    Shutdown,
}

enum TransportEvent {
    Opened,
    Message(WireMessage),
    Closed,
    Failed(String),
}

enum Internal {
    Transport {
        attempt: AttemptId,
        event: TransportEvent,
    },
    Negotiated {
        cycle: CycleId,
        candidates: Vec<Candidate>,
    },
    Authorized {
        channel: Arc<Channel>,
        socket_id: String,
        result: Result<AuthToken, AuthError>,
    },
}

/// Builds a [`Client`] with non-default collaborators.
pub struct ClientBuilder {
    config: ClientConfig,
    catalog: Option<TransportCatalog>,
    loader: Option<Arc<dyn TransportLoader>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    capabilities: Option<CapabilityCache>,
}

impl ClientBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            catalog: None,
            loader: None,
            authorizer: None,
            capabilities: None,
        }
    }

    /// Negotiate over `catalog` instead of the standard one.
    #[must_use]
    pub fn catalog(mut self, catalog: TransportCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Load transports that are not compiled in with `loader`.
    #[must_use]
    pub fn loader(mut self, loader: Arc<dyn TransportLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Authorize protected channels with `authorizer`.
    #[must_use]
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Use `capabilities` instead of probing the runtime.
    #[must_use]
    pub fn capabilities(mut self, capabilities: CapabilityCache) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Validate the configuration and start the driver task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<Client, ClientError> {
        self.config.validate()?;
        metrics::describe();

        let registry = Arc::new(ChannelRegistry::with_config(RegistryConfig {
            max_channels: self.config.max_channels,
        }));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));

        let catalog = self
            .catalog
            .unwrap_or_else(|| TransportCatalog::standard_with(&self.config.transport_options()));
        let mut negotiator = Negotiator::new(Arc::new(catalog));
        if let Some(loader) = self.loader {
            negotiator = negotiator.with_loader(loader);
        }
        let authorizer = self
            .authorizer
            .or_else(|| default_authorizer(&self.config));

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Initialized);
        let (info_tx, info_rx) = watch::channel(ConnectionInfo::default());

        let driver = Driver {
            endpoint: self.config.endpoint(),
            machine: ConnectionMachine::new(
                self.config.reconnect_policy,
                self.config.max_attempts_per_cycle,
            ),
            config: self.config,
            registry: Arc::clone(&registry),
            dispatcher: Arc::clone(&dispatcher),
            negotiator: Arc::new(negotiator),
            capabilities: Arc::new(self.capabilities.unwrap_or_default()),
            authorizer,
            commands: commands_rx,
            internal_tx,
            internal_rx,
            state_tx,
            info_tx,
            active: None,
            open_deadline: None,
            keepalive: None,
        };
        tokio::spawn(driver.run());

        Ok(Client {
            commands: commands_tx,
            registry,
            dispatcher,
            state: state_rx,
            info: info_rx,
        })
    }
}

#[cfg(feature = "http")]
fn default_authorizer(config: &ClientConfig) -> Option<Arc<dyn Authorizer>> {
    config
        .auth_endpoint
        .as_ref()
        .map(|endpoint| Arc::new(crate::auth::HttpAuthorizer::new(endpoint.clone())) as Arc<dyn Authorizer>)
}

#[cfg(not(feature = "http"))]
fn default_authorizer(_config: &ClientConfig) -> Option<Arc<dyn Authorizer>> {
    None
}

/// Handle to a realtime connection and its channels.
///
/// Clones share the same connection. The driver stops once every handle is
/// dropped or [`shutdown`](Self::shutdown) is called. A handle captured by a
/// bound handler counts as a live handle, so a client referenced from its own
/// handlers runs until `shutdown`, which unbinds every handler.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<ChannelRegistry>,
    dispatcher: Arc<Dispatcher>,
    state: watch::Receiver<ConnectionState>,
    info: watch::Receiver<ConnectionInfo>,
}

impl Client {
    /// Start a client with the standard transports.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        ClientBuilder::new(config).build()
    }

    /// Start building a client.
    #[must_use]
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    /// Start connecting. Does nothing while already connecting or connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has shut down.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.command(Command::Connect)
    }

    /// Close the connection. No reconnection happens until the next
    /// [`connect`](Self::connect); channels are kept and resubscribed then.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has shut down.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect)
    }

    /// Stop the driver task, dropping every channel and handler.
    pub fn shutdown(&self) {
        let _ = self.command(Command::Shutdown);
    }

    /// Subscribe to `name`. Subscribing twice returns the same channel.
    ///
    /// The subscribe request goes out as soon as the connection is up.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the client has shut down.
    pub fn subscribe(&self, name: &str) -> Result<Arc<Channel>, ClientError> {
        let (channel, created) = self.registry.subscribe(name)?;
        if created {
            if let Err(e) = self.command(Command::Subscribe(Arc::clone(&channel))) {
                self.registry.unsubscribe(name);
                return Err(e);
            }
            metrics::set_subscriptions(self.registry.len());
        }
        Ok(channel)
    }

    /// Unsubscribe from `name`. Its handlers are dropped with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has shut down.
    pub fn unsubscribe(&self, name: &str) -> Result<(), ClientError> {
        if self.registry.unsubscribe(name).is_some() {
            metrics::set_subscriptions(self.registry.len());
            self.command(Command::Unsubscribe(name.to_string()))?;
        }
        Ok(())
    }

    /// Get a channel by name.
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.registry.get(name)
    }

    /// Names of every channel held.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.registry.channel_names()
    }

    /// Bind a handler to `event` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel does not exist.
    pub fn bind<F>(&self, channel: &str, event: impl Into<String>, handler: F) -> Result<HandlerId, ClientError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let channel = self
            .registry
            .get(channel)
            .ok_or_else(|| ClientError::NotSubscribed(channel.to_string()))?;
        Ok(channel.bind(event, handler))
    }

    /// Remove a handler from `event` on `channel`.
    pub fn unbind(&self, channel: &str, event: &str, id: HandlerId) -> bool {
        self.registry
            .get(channel)
            .is_some_and(|channel| channel.unbind(event, id))
    }

    /// Bind a handler to a connection-scoped event, such as
    /// `herald:connection_established`, `herald:error` or [`STATE_CHANGE`].
    pub fn bind_connection<F>(&self, event: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.dispatcher.bind_connection(event, handler)
    }

    /// Remove a connection-scoped handler.
    pub fn unbind_connection(&self, event: &str, id: HandlerId) -> bool {
        self.dispatcher.unbind_connection(event, id)
    }

    /// Bind a handler receiving every channel event.
    pub fn bind_global<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str, &str, &Value) + Send + Sync + 'static,
    {
        self.dispatcher.bind_global(handler)
    }

    /// Remove a global handler.
    pub fn unbind_global(&self, id: HandlerId) -> bool {
        self.dispatcher.unbind_global(id)
    }

    /// Send a client event to the other members of `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event lacks the `client-` prefix, the channel
    /// is not protected or not subscribed, or the client has shut down.
    pub fn trigger(&self, channel: &str, event: &str, data: Value) -> Result<(), ClientError> {
        if !event.starts_with(events::CLIENT_EVENT_PREFIX) {
            return Err(ClientError::InvalidEvent(event.to_string()));
        }
        if !requires_auth(channel) {
            return Err(ClientError::UnprotectedChannel(channel.to_string()));
        }
        if !self.registry.get(channel).is_some_and(|c| c.is_subscribed()) {
            return Err(ClientError::NotSubscribed(channel.to_string()));
        }
        self.command(Command::Send(Frame::client_event(channel, event, data)))
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client shuts down first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }

    /// Details of the current connection.
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        self.info.borrow().clone()
    }

    /// Receiver notified whenever [`info`](Self::info) changes.
    #[must_use]
    pub fn watch_info(&self) -> watch::Receiver<ConnectionInfo> {
        self.info.clone()
    }

    /// Socket id of the established connection.
    #[must_use]
    pub fn socket_id(&self) -> Option<String> {
        self.info.borrow().socket_id.clone()
    }

    /// Transport currently attempted or in use.
    #[must_use]
    pub fn transport(&self) -> Option<&'static str> {
        self.info.borrow().transport
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("info", &self.info())
            .field("channels", &self.registry.len())
            .finish()
    }
}

/// The transport attempt owned by the driver.
struct ActiveTransport {
    attempt: AttemptId,
    name: &'static str,
    outbound: mpsc::UnboundedSender<Frame>,
    task: JoinHandle<()>,
    opened: bool,
}

impl ActiveTransport {
    /// An opened transport closes gracefully once its queue is dropped; one
    /// still opening is cancelled.
    fn close(self) {
        debug!(transport = self.name, attempt = %self.attempt, "Closing transport");
        drop(self.outbound);
        if !self.opened {
            self.task.abort();
        }
    }
}

/// Activity tracking of an established connection.
struct Keepalive {
    activity_timeout: Duration,
    pong_timeout: Duration,
    last_seen: Instant,
    ping_sent: Option<Instant>,
}

impl Keepalive {
    fn new(activity_timeout: Duration, pong_timeout: Duration) -> Self {
        Self {
            activity_timeout,
            pong_timeout,
            last_seen: Instant::now(),
            ping_sent: None,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.ping_sent = None;
    }

    fn deadline(&self) -> Instant {
        match self.ping_sent {
            Some(sent) => sent + self.pong_timeout,
            None => self.last_seen + self.activity_timeout,
        }
    }
}

struct Driver {
    config: ClientConfig,
    endpoint: Endpoint,
    machine: ConnectionMachine,
    registry: Arc<ChannelRegistry>,
    dispatcher: Arc<Dispatcher>,
    negotiator: Arc<Negotiator>,
    capabilities: Arc<CapabilityCache>,
    authorizer: Option<Arc<dyn Authorizer>>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    state_tx: watch::Sender<ConnectionState>,
    info_tx: watch::Sender<ConnectionInfo>,
    active: Option<ActiveTransport>,
    open_deadline: Option<Instant>,
    keepalive: Option<Keepalive>,
}

impl Driver {
    async fn run(mut self) {
        debug!(app_key = %self.config.app_key, "Client driver started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                () = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.handle_timer();
                }
            }
        }
        self.teardown();
    }

    fn next_deadline(&self) -> Option<Instant> {
        let keepalive = self.keepalive.as_ref().map(Keepalive::deadline);
        match (self.open_deadline, keepalive) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                let effects = self.machine.connect();
                self.apply(effects);
            }
            Command::Disconnect => self.disconnect(),
            Command::Subscribe(channel) => {
                if self.is_connected() && channel.needs_request() && self.registry.is_current(&channel) {
                    self.request_subscription(channel);
                }
            }
            Command::Unsubscribe(name) => {
                if self.is_connected() {
                    self.send(Frame::unsubscribe(&name));
                }
            }
            Command::Send(frame) => {
                if !self.is_connected() || !self.send(frame) {
                    warn!("Dropping client event, not connected");
                }
            }
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Transport { attempt, event } => self.handle_transport(attempt, event),
            Internal::Negotiated { cycle, candidates } => {
                let effects = self.machine.candidates_ready(cycle, candidates);
                self.apply(effects);
            }
            Internal::Authorized {
                channel,
                socket_id,
                result,
            } => self.handle_authorized(channel, &socket_id, result),
        }
    }

    fn handle_transport(&mut self, attempt: AttemptId, event: TransportEvent) {
        let Some(active) = self.active.as_mut().filter(|a| a.attempt == attempt) else {
            trace!(%attempt, "Ignoring event from superseded transport");
            return;
        };
        let name = active.name;

        match event {
            TransportEvent::Opened => {
                active.opened = true;
                if self.machine.transport_opened(attempt) {
                    debug!(transport = name, %attempt, "Transport open, awaiting handshake");
                }
            }
            TransportEvent::Message(message) => self.handle_message(attempt, &message),
            TransportEvent::Closed => {
                if self.machine.state() == ConnectionState::Connecting {
                    metrics::record_fallback(name);
                }
                let effects = self.machine.transport_closed(attempt);
                self.apply(effects);
            }
            TransportEvent::Failed(reason) => {
                if self.machine.state() == ConnectionState::Connecting {
                    metrics::record_fallback(name);
                }
                let effects = self.machine.transport_failed(attempt, &reason);
                self.apply(effects);
            }
        }
    }

    fn handle_message(&mut self, attempt: AttemptId, message: &WireMessage) {
        if let Some(keepalive) = self.keepalive.as_mut() {
            keepalive.touch();
        }
        let Some(frame) = self.dispatcher.decode(message) else {
            return;
        };

        match self.dispatcher.dispatch(frame) {
            Dispatch::Established(established) => {
                let effects = self.machine.handshake(attempt, &established.socket_id);
                if effects.is_empty() {
                    debug!("Ignoring repeated handshake");
                    return;
                }
                self.apply(effects);
                if let (Some(keepalive), Some(secs)) = (self.keepalive.as_mut(), established.activity_timeout) {
                    if secs > 0 {
                        keepalive.activity_timeout = keepalive.activity_timeout.min(Duration::from_secs(secs));
                    }
                }
                let data = serde_json::to_value(&established).unwrap_or(Value::Null);
                self.dispatcher.emit_connection(events::CONNECTION_ESTABLISHED, &data);
            }
            Dispatch::Error(error) => self.handle_service_error(error),
            Dispatch::Ping => {
                self.send(Frame::pong());
            }
            Dispatch::Pong => trace!("Pong received"),
            Dispatch::Delivered(handlers) => trace!(handlers, "Frame delivered"),
            Dispatch::Dropped => {}
        }
    }

    fn handle_service_error(&mut self, error: ErrorData) {
        warn!(code = ?error.code, message = %error.message, "Service error");
        let data = serde_json::to_value(&error).unwrap_or(Value::Null);
        self.dispatcher.emit_connection(events::ERROR, &data);

        match error.code {
            Some(4000..=4099) => self.disconnect(),
            Some(4100..=4199) => {
                let effects = self.machine.reconnect(self.config.reconnect_backoff());
                self.apply(effects);
            }
            Some(4200..=4299) => {
                let effects = self.machine.reconnect(Duration::ZERO);
                self.apply(effects);
            }
            _ => {}
        }
    }

    fn handle_authorized(&mut self, channel: Arc<Channel>, socket_id: &str, result: Result<AuthToken, AuthError>) {
        let current = self.is_connected()
            && self.machine.socket_id() == Some(socket_id)
            && self.registry.is_current(&channel)
            && channel.request_phase() == RequestPhase::Authorizing;
        if !current {
            debug!(channel = %channel.name(), "Discarding stale authorization");
            return;
        }

        match result {
            Ok(token) => {
                if self.send(Frame::subscribe(channel.name(), Some(&token))) {
                    channel.set_request_phase(RequestPhase::Sent);
                } else {
                    channel.reject();
                }
            }
            Err(e) => self.authorization_failed(&channel, &e),
        }
    }

    fn handle_timer(&mut self) {
        let now = Instant::now();

        if self.open_deadline.is_some_and(|deadline| now >= deadline) {
            self.open_deadline = None;
            if let Some(attempt) = self.machine.current_attempt() {
                warn!(transport = self.machine.current_transport(), %attempt, "Transport timed out");
                if let Some(name) = self.machine.current_transport() {
                    metrics::record_fallback(name);
                }
                let effects = self.machine.transport_failed(attempt, "timeout");
                self.apply(effects);
            }
            return;
        }

        let Some(keepalive) = self.keepalive.as_mut() else {
            return;
        };
        if now < keepalive.deadline() {
            return;
        }
        if keepalive.ping_sent.is_none() {
            keepalive.ping_sent = Some(now);
            debug!("Connection idle, sending ping");
            self.send(Frame::ping());
        } else if let Some(attempt) = self.machine.current_attempt() {
            warn!(transport = self.machine.current_transport(), "Pong timeout");
            let effects = self.machine.transport_closed(attempt);
            self.apply(effects);
        }
    }

    fn disconnect(&mut self) {
        let effects = self.machine.disconnect();
        self.apply(effects);
        self.machine.finish_disconnect();
        self.publish();
    }

    fn is_connected(&self) -> bool {
        self.machine.state() == ConnectionState::Connected
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        self.publish();
        for effect in effects {
            match effect {
                Effect::Open { attempt, candidate } => self.open(attempt, candidate),
                Effect::Close => self.close_transport(),
                Effect::Negotiate { cycle, delay, refresh } => self.negotiate(cycle, delay, refresh),
                Effect::Established { socket_id } => self.established(&socket_id),
                Effect::SubscriptionsLost => self.registry.reset_all(),
            }
        }
        self.publish();
    }

    fn open(&mut self, attempt: AttemptId, candidate: Candidate) {
        if let Some(previous) = self.active.take() {
            previous.close();
        }
        let name = candidate.name();
        info!(transport = name, %attempt, "Opening transport");
        metrics::record_attempt(name);

        let (outbound, queue) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_attempt(
            candidate,
            self.endpoint.clone(),
            attempt,
            self.internal_tx.clone(),
            queue,
        ));
        self.active = Some(ActiveTransport {
            attempt,
            name,
            outbound,
            task,
            opened: false,
        });
        self.open_deadline = Some(Instant::now() + self.config.transport_timeout());
        self.keepalive = None;
    }

    fn close_transport(&mut self) {
        if let Some(active) = self.active.take() {
            active.close();
        }
        self.open_deadline = None;
        self.keepalive = None;
    }

    fn negotiate(&self, cycle: CycleId, delay: Duration, refresh: bool) {
        if refresh {
            self.capabilities.invalidate();
        }
        let negotiator = Arc::clone(&self.negotiator);
        let capabilities = Arc::clone(&self.capabilities);
        let encryption_required = self.config.encryption_required;
        let priority = self.config.transports.clone();
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let env = Environment::new(encryption_required, capabilities.get());
            let candidates = negotiator.negotiate(&env, &priority).await;
            let _ = internal.send(Internal::Negotiated { cycle, candidates });
        });
    }

    fn established(&mut self, socket_id: &str) {
        info!(%socket_id, transport = self.machine.current_transport(), "Connected");
        self.open_deadline = None;
        self.keepalive = Some(Keepalive::new(
            self.config.activity_timeout(),
            self.config.pong_timeout(),
        ));
        for channel in self.registry.pending() {
            self.request_subscription(channel);
        }
    }

    fn request_subscription(&mut self, channel: Arc<Channel>) {
        if !requires_auth(channel.name()) {
            if self.send(Frame::subscribe(channel.name(), None)) {
                channel.set_request_phase(RequestPhase::Sent);
            }
            return;
        }

        let Some(socket_id) = self.machine.socket_id().map(str::to_string) else {
            return;
        };
        let Some(authorizer) = self.authorizer.clone() else {
            self.authorization_failed(&channel, &AuthError::NotConfigured);
            return;
        };

        channel.set_request_phase(RequestPhase::Authorizing);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = authorizer.authorize(&socket_id, channel.name()).await;
            let _ = internal.send(Internal::Authorized {
                channel,
                socket_id,
                result,
            });
        });
    }

    fn authorization_failed(&self, channel: &Channel, error: &AuthError) {
        warn!(channel = %channel.name(), %error, "Channel authorization failed");
        channel.reject();
        let data = json!({
            "type": "AuthError",
            "error": error.to_string(),
            "status": error.status(),
        });
        self.dispatcher.emit_channel(channel, events::SUBSCRIPTION_ERROR, &data);
    }

    fn send(&self, frame: Frame) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        trace!(event = %frame.event, channel = ?frame.channel, "Sending frame");
        if active.outbound.send(frame).is_ok() {
            metrics::record_frame(Direction::Outbound);
            true
        } else {
            false
        }
    }

    /// Publish state and details to watchers, firing [`STATE_CHANGE`].
    fn publish(&self) {
        let current = self.machine.state();
        let previous = *self.state_tx.borrow();
        if previous != current {
            self.state_tx.send_replace(current);
            let data = json!({ "previous": previous.as_str(), "current": current.as_str() });
            self.dispatcher.emit_connection(STATE_CHANGE, &data);
        }

        let info = ConnectionInfo {
            transport: self.machine.current_transport(),
            socket_id: self.machine.socket_id().map(str::to_string),
            retry_count: self.machine.retry_count(),
        };
        self.info_tx.send_if_modified(move |existing| {
            if *existing == info {
                false
            } else {
                *existing = info;
                true
            }
        });
    }

    fn teardown(&mut self) {
        let effects = self.machine.disconnect();
        self.apply(effects);
        self.machine.finish_disconnect();
        self.publish();
        self.registry.clear();
        self.dispatcher.clear();
        metrics::set_subscriptions(0);
        debug!("Client driver stopped");
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

/// Drive one transport attempt: open, then pump frames both ways until
/// either side closes. Dropping the outbound queue closes the connection.
async fn run_attempt(
    candidate: Candidate,
    endpoint: Endpoint,
    attempt: AttemptId,
    internal: mpsc::UnboundedSender<Internal>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    let report = |event: TransportEvent| {
        let _ = internal.send(Internal::Transport { attempt, event });
    };

    let mut conn = match candidate.transport.open(&endpoint).await {
        Ok(conn) => conn,
        Err(e) => {
            report(TransportEvent::Failed(e.to_string()));
            return;
        }
    };
    report(TransportEvent::Opened);
    let encoding = conn.encoding();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let message = match codec::encode(&frame, encoding) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, event = %frame.event, "Failed to encode frame");
                            continue;
                        }
                    };
                    if let Err(e) = conn.send(message).await {
                        report(TransportEvent::Failed(e.to_string()));
                        return;
                    }
                }
                None => {
                    if let Err(e) = conn.close().await {
                        debug!(transport = candidate.name(), error = %e, "Close failed");
                    }
                    return;
                }
            },
            message = conn.recv() => match message {
                Ok(Some(message)) => report(TransportEvent::Message(message)),
                Ok(None) => {
                    report(TransportEvent::Closed);
                    return;
                }
                Err(e) => {
                    report(TransportEvent::Failed(e.to_string()));
                    return;
                }
            },
        }
    }
}
