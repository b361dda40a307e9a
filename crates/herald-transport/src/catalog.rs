//! Transport descriptors and the environment they are judged against.
//!
//! A [`TransportCatalog`] lists every transport the client knows about,
//! whether or not an implementation is compiled in. Descriptors are
//! immutable; implementations are attached at registration or supplied
//! later by a [`TransportLoader`](crate::negotiator::TransportLoader).

use crate::traits::Transport;
use herald_protocol::Encoding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Family a transport belongs to; the unit of priority ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent bidirectional socket.
    Socket,
    /// Long-lived HTTP response carrying frames as they arrive.
    Streaming,
    /// Repeated short HTTP requests.
    Polling,
}

impl TransportKind {
    /// Default priority order.
    pub const DEFAULT_PRIORITY: [TransportKind; 3] = [
        TransportKind::Socket,
        TransportKind::Streaming,
        TransportKind::Polling,
    ];
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Socket => "socket",
            TransportKind::Streaming => "streaming",
            TransportKind::Polling => "polling",
        };
        f.write_str(name)
    }
}

/// A runtime feature a transport may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Capability {
    /// Raw socket connections can reach the service (no forced proxy).
    Socket = 0b0001,
    /// HTTP responses can be consumed incrementally.
    HttpStreaming = 0b0010,
    /// Plain HTTP requests work.
    Http = 0b0100,
    /// TLS is available.
    Tls = 0b1000,
}

/// A set of [`Capability`] flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    /// The empty set.
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    /// Every capability.
    #[must_use]
    pub const fn all() -> Self {
        Self(0b1111)
    }

    /// Build a set from a list of flags.
    #[must_use]
    pub fn from_slice(flags: &[Capability]) -> Self {
        flags.iter().fold(Self::none(), |set, flag| set.with(*flag))
    }

    /// Return this set with `flag` added.
    #[must_use]
    pub const fn with(self, flag: Capability) -> Self {
        Self(self.0 | flag as u8)
    }

    /// Return this set with `flag` removed.
    #[must_use]
    pub const fn without(self, flag: Capability) -> Self {
        Self(self.0 & !(flag as u8))
    }

    /// Whether `flag` is present.
    #[must_use]
    pub const fn contains(self, flag: Capability) -> bool {
        self.0 & flag as u8 != 0
    }

    /// Whether every flag of `other` is present.
    #[must_use]
    pub const fn contains_all(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    /// Probe the current process.
    ///
    /// Socket transports cannot traverse an HTTP proxy, so a configured
    /// proxy removes [`Capability::Socket`]. TLS depends on the `tls` feature.
    #[must_use]
    pub fn probe() -> Self {
        let mut caps = Self::none()
            .with(Capability::Socket)
            .with(Capability::HttpStreaming)
            .with(Capability::Http);
        let proxied = ["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]
            .iter()
            .any(|var| std::env::var_os(var).is_some_and(|v| !v.is_empty()));
        if proxied {
            caps = caps.without(Capability::Socket);
        }
        if cfg!(feature = "tls") {
            caps = caps.with(Capability::Tls);
        }
        caps
    }
}

type Probe = dyn Fn() -> Capabilities + Send + Sync;

/// Caches the result of a capability probe until invalidated.
pub struct CapabilityCache {
    probe: Box<Probe>,
    cached: Mutex<Option<Capabilities>>,
}

impl CapabilityCache {
    /// Cache the built-in [`Capabilities::probe`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_probe(Capabilities::probe)
    }

    /// Cache a custom probe.
    #[must_use]
    pub fn with_probe(probe: impl Fn() -> Capabilities + Send + Sync + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            cached: Mutex::new(None),
        }
    }

    /// A cache that always reports `caps`.
    #[must_use]
    pub fn fixed(caps: Capabilities) -> Self {
        Self::with_probe(move || caps)
    }

    /// Get the cached capabilities, probing on first use.
    pub fn get(&self) -> Capabilities {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        *cached.get_or_insert_with(|| {
            let caps = (self.probe)();
            debug!(?caps, "Probed runtime capabilities");
            caps
        })
    }

    /// Forget the cached result; the next [`get`](Self::get) probes again.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CapabilityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityCache")
            .field("cached", &self.cached)
            .finish_non_exhaustive()
    }
}

/// What the client needs and what the runtime can do, for one negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Environment {
    /// Whether only encrypted transports may be used.
    pub encryption_required: bool,
    /// Features available to transports.
    pub capabilities: Capabilities,
}

impl Environment {
    /// Create an environment.
    #[must_use]
    pub const fn new(encryption_required: bool, capabilities: Capabilities) -> Self {
        Self {
            encryption_required,
            capabilities,
        }
    }
}

/// Static description of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportDescriptor {
    name: &'static str,
    kind: TransportKind,
    tls: bool,
    requires: Capabilities,
}

impl TransportDescriptor {
    /// Describe a transport. TLS variants implicitly require [`Capability::Tls`].
    #[must_use]
    pub const fn new(name: &'static str, kind: TransportKind, tls: bool, requires: Capabilities) -> Self {
        let requires = if tls {
            requires.with(Capability::Tls)
        } else {
            requires
        };
        Self {
            name,
            kind,
            tls,
            requires,
        }
    }

    /// Transport name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Transport family.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Whether this is the TLS variant.
    #[must_use]
    pub const fn supports_encrypted(&self) -> bool {
        self.tls
    }

    /// Whether the runtime described by `env` can use this transport at all.
    #[must_use]
    pub const fn is_supported_in(&self, env: &Environment) -> bool {
        env.capabilities.contains_all(self.requires)
    }
}

/// Descriptors for the standard transports, plain variants first.
pub mod standard {
    use super::{Capabilities, Capability, TransportDescriptor, TransportKind};

    const SOCKET: Capabilities = Capabilities::none().with(Capability::Socket);
    const STREAMING: Capabilities = Capabilities::none()
        .with(Capability::Http)
        .with(Capability::HttpStreaming);
    const POLLING: Capabilities = Capabilities::none().with(Capability::Http);

    pub const WS: TransportDescriptor = TransportDescriptor::new("ws", TransportKind::Socket, false, SOCKET);
    pub const WSS: TransportDescriptor = TransportDescriptor::new("wss", TransportKind::Socket, true, SOCKET);
    pub const XHR_STREAMING: TransportDescriptor =
        TransportDescriptor::new("xhr_streaming", TransportKind::Streaming, false, STREAMING);
    pub const XHRS_STREAMING: TransportDescriptor =
        TransportDescriptor::new("xhrs_streaming", TransportKind::Streaming, true, STREAMING);
    pub const XHR_POLLING: TransportDescriptor =
        TransportDescriptor::new("xhr_polling", TransportKind::Polling, false, POLLING);
    pub const XHRS_POLLING: TransportDescriptor =
        TransportDescriptor::new("xhrs_polling", TransportKind::Polling, true, POLLING);

    /// All standard descriptors.
    pub const ALL: [TransportDescriptor; 6] = [WS, WSS, XHR_STREAMING, XHRS_STREAMING, XHR_POLLING, XHRS_POLLING];
}

/// Settings shared by the built-in transport implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Encoding used by socket transports. HTTP transports always use JSON.
    pub encoding: Encoding,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// TCP connect timeout for HTTP requests.
    pub http_connect_timeout: Duration,
    /// Pause of the polling transport after a poll that returned nothing.
    pub poll_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::Json,
            max_message_size: 64 * 1024, // 64 KB
            http_connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// A catalog entry: descriptor plus the statically present implementation.
#[derive(Clone)]
pub struct CatalogEntry {
    /// The descriptor.
    pub descriptor: TransportDescriptor,
    /// Implementation, if compiled in.
    pub transport: Option<Arc<dyn Transport>>,
}

impl fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("descriptor", &self.descriptor)
            .field("builtin", &self.transport.is_some())
            .finish()
    }
}

/// The set of transports a client may negotiate between.
#[derive(Debug, Clone, Default)]
pub struct TransportCatalog {
    entries: Vec<CatalogEntry>,
}

impl TransportCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the standard transports with every compiled-in implementation attached.
    ///
    /// Descriptors whose implementation is not compiled in are still listed so
    /// that a loader can provide them.
    #[must_use]
    pub fn standard() -> Self {
        Self::standard_with(&TransportOptions::default())
    }

    /// Like [`standard`](Self::standard), with explicit transport options.
    #[must_use]
    pub fn standard_with(options: &TransportOptions) -> Self {
        let mut catalog = Self::new();
        for descriptor in standard::ALL {
            catalog.register(descriptor, builtin_transport(&descriptor, options));
        }
        catalog
    }

    /// Add or replace a transport.
    pub fn register(&mut self, descriptor: TransportDescriptor, transport: Option<Arc<dyn Transport>>) {
        let entry = CatalogEntry {
            descriptor,
            transport,
        };
        match self
            .entries
            .iter_mut()
            .find(|e| e.descriptor.name() == descriptor.name())
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Look up a transport by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.descriptor.name() == name)
    }

    /// Iterate entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    /// Number of registered transports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[allow(unused_variables)]
fn builtin_transport(descriptor: &TransportDescriptor, options: &TransportOptions) -> Option<Arc<dyn Transport>> {
    match descriptor.kind() {
        #[cfg(feature = "websocket")]
        TransportKind::Socket => Some(Arc::new(crate::websocket::WebSocketTransport::with_options(
            descriptor.name(),
            descriptor.supports_encrypted(),
            options.clone(),
        ))),
        #[cfg(feature = "http")]
        TransportKind::Streaming => Some(Arc::new(crate::http::HttpStreamingTransport::with_options(
            descriptor.name(),
            descriptor.supports_encrypted(),
            options,
        ))),
        #[cfg(feature = "http")]
        TransportKind::Polling => Some(Arc::new(crate::http::HttpPollingTransport::with_options(
            descriptor.name(),
            descriptor.supports_encrypted(),
            options,
        ))),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_capability_set() {
        let caps = Capabilities::none().with(Capability::Http).with(Capability::Tls);
        assert!(caps.contains(Capability::Http));
        assert!(!caps.contains(Capability::Socket));
        assert!(caps.contains_all(Capabilities::from_slice(&[Capability::Http])));
        assert!(!caps.contains_all(Capabilities::all()));
        assert!(!caps.without(Capability::Tls).contains(Capability::Tls));
    }

    #[test]
    fn test_descriptor_support() {
        let plain = Environment::new(false, Capabilities::all().without(Capability::Tls));
        assert!(standard::WS.is_supported_in(&plain));
        assert!(!standard::WSS.is_supported_in(&plain));
        assert!(standard::WSS.supports_encrypted());

        let proxied = Environment::new(false, Capabilities::all().without(Capability::Socket));
        assert!(!standard::WS.is_supported_in(&proxied));
        assert!(standard::XHR_POLLING.is_supported_in(&proxied));
    }

    #[test]
    fn test_capability_cache_probes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = CapabilityCache::with_probe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Capabilities::all()
        });

        assert_eq!(cache.get(), Capabilities::all());
        assert_eq!(cache.get(), Capabilities::all());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        cache.get();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_catalog_register_replaces() {
        let mut catalog = TransportCatalog::new();
        catalog.register(standard::WS, None);
        catalog.register(standard::XHR_POLLING, None);
        catalog.register(standard::WS, None);

        assert_eq!(catalog.len(), 2);
        assert!(catalog.get("ws").is_some());
        assert!(catalog.get("wss").is_none());
    }

    #[test]
    fn test_standard_catalog_lists_everything() {
        let catalog = TransportCatalog::standard();
        assert_eq!(catalog.len(), standard::ALL.len());
        #[cfg(feature = "websocket")]
        assert!(catalog.get("ws").and_then(|e| e.transport.as_ref()).is_some());
    }
}
