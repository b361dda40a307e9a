//! Transport negotiation and fallback ordering.
//!
//! Negotiation happens in two steps. [`select_candidates`] is a pure filter
//! over the catalog; [`Negotiator::resolve`] then makes sure every surviving
//! candidate has an implementation, asking the injected [`TransportLoader`]
//! for the ones that are not compiled in.

use crate::catalog::{Environment, TransportCatalog, TransportDescriptor, TransportKind};
use crate::traits::Transport;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure to provide a transport implementation.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The loader has no implementation for this transport.
    #[error("No implementation available for transport {0}")]
    NotAvailable(String),

    /// Fetching or registering the implementation failed.
    #[error("Failed to load transport {name}: {reason}")]
    Failed {
        /// Transport name.
        name: String,
        /// Why loading failed.
        reason: String,
    },
}

/// Supplies implementations for transports that are not compiled in.
#[async_trait]
pub trait TransportLoader: Send + Sync {
    /// Fetch an implementation for `descriptor`.
    async fn load(&self, descriptor: &TransportDescriptor) -> Result<Arc<dyn Transport>, LoadError>;
}

/// A transport ready to be attempted.
#[derive(Clone)]
pub struct Candidate {
    /// What is being attempted.
    pub descriptor: TransportDescriptor,
    /// The implementation to open it with.
    pub transport: Arc<dyn Transport>,
}

impl Candidate {
    /// Transport name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.descriptor.name()
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Candidate").field(&self.descriptor.name()).finish()
    }
}

/// Select the descriptors usable in `env`, ordered by `priority`.
///
/// Kinds absent from `priority` are never selected and repeated kinds only
/// count once. Within a kind, catalog order is kept. The result is empty when
/// nothing qualifies.
#[must_use]
pub fn select_candidates(
    catalog: &TransportCatalog,
    env: &Environment,
    priority: &[TransportKind],
) -> Vec<TransportDescriptor> {
    let mut selected = Vec::new();
    for (position, kind) in priority.iter().enumerate() {
        if priority[..position].contains(kind) {
            continue;
        }
        selected.extend(
            catalog
                .iter()
                .map(|entry| entry.descriptor)
                .filter(|d| d.kind() == *kind)
                .filter(|d| d.supports_encrypted() == env.encryption_required)
                .filter(|d| d.is_supported_in(env)),
        );
    }
    selected
}

/// Produces ordered, loadable candidate lists.
pub struct Negotiator {
    catalog: Arc<TransportCatalog>,
    loader: Option<Arc<dyn TransportLoader>>,
    loaded: DashMap<&'static str, Arc<dyn Transport>>,
}

impl Negotiator {
    /// Create a negotiator without a loader; only built-in transports are usable.
    #[must_use]
    pub fn new(catalog: Arc<TransportCatalog>) -> Self {
        Self {
            catalog,
            loader: None,
            loaded: DashMap::new(),
        }
    }

    /// Attach a loader for transports that are not compiled in.
    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn TransportLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// The catalog negotiated over.
    #[must_use]
    pub fn catalog(&self) -> &TransportCatalog {
        &self.catalog
    }

    /// See [`select_candidates`].
    #[must_use]
    pub fn select(&self, env: &Environment, priority: &[TransportKind]) -> Vec<TransportDescriptor> {
        select_candidates(&self.catalog, env, priority)
    }

    /// Attach implementations to `descriptors`, loading missing ones.
    ///
    /// A descriptor that cannot be loaded is dropped from this result only;
    /// the next call asks the loader again.
    pub async fn resolve(&self, descriptors: Vec<TransportDescriptor>) -> Vec<Candidate> {
        let mut candidates = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if let Some(transport) = self.implementation(&descriptor).await {
                candidates.push(Candidate {
                    descriptor,
                    transport,
                });
            }
        }
        candidates
    }

    /// Select and resolve in one step.
    pub async fn negotiate(&self, env: &Environment, priority: &[TransportKind]) -> Vec<Candidate> {
        let selected = self.select(env, priority);
        debug!(
            transports = ?selected.iter().map(TransportDescriptor::name).collect::<Vec<_>>(),
            "Selected transport candidates"
        );
        self.resolve(selected).await
    }

    async fn implementation(&self, descriptor: &TransportDescriptor) -> Option<Arc<dyn Transport>> {
        if let Some(builtin) = self
            .catalog
            .get(descriptor.name())
            .and_then(|entry| entry.transport.clone())
        {
            return Some(builtin);
        }
        if let Some(loaded) = self.loaded.get(descriptor.name()) {
            return Some(Arc::clone(loaded.value()));
        }

        let Some(loader) = &self.loader else {
            debug!(transport = descriptor.name(), "No implementation and no loader");
            return None;
        };

        match loader.load(descriptor).await {
            Ok(transport) => {
                debug!(transport = descriptor.name(), "Loaded transport");
                self.loaded.insert(descriptor.name(), Arc::clone(&transport));
                Some(transport)
            }
            Err(e) => {
                warn!(transport = descriptor.name(), error = %e, "Dropping candidate");
                None
            }
        }
    }
}

impl fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiator")
            .field("catalog", &self.catalog)
            .field("has_loader", &self.loader.is_some())
            .field("loaded", &self.loaded.len())
            .finish()
    }
}
