//! Channel registry for Herald.
//!
//! The registry owns every live [`Channel`] of a client, keyed by name.
//! Channels are shared with callers through `Arc`, so a handle outlives its
//! removal from the registry without ever receiving events again. Removal
//! also drops the channel's handlers, releasing whatever they captured.

use crate::channel::{validate_channel_name, Channel, ChannelId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Maximum channels reached.
    #[error("Maximum channels reached ({0})")]
    MaxChannelsReached(usize),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of channels one client may hold.
    pub max_channels: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_channels: 10_000,
        }
    }
}

/// The channel registry.
#[derive(Debug)]
pub struct ChannelRegistry {
    /// Channels indexed by name.
    channels: DashMap<ChannelId, Arc<Channel>>,
    /// Next creation sequence number.
    next_seq: AtomicU64,
    /// Configuration.
    config: RegistryConfig,
}

impl ChannelRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        debug!("Creating channel registry with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            next_seq: AtomicU64::new(0),
            config,
        }
    }

    /// Get or create the channel `name`.
    ///
    /// Returns the channel and whether it was created by this call.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the limit is reached.
    pub fn subscribe(&self, name: &str) -> Result<(Arc<Channel>, bool), RegistryError> {
        validate_channel_name(name).map_err(RegistryError::InvalidChannel)?;

        if let Some(existing) = self.channels.get(name) {
            return Ok((Arc::clone(existing.value()), false));
        }
        if self.channels.len() >= self.config.max_channels {
            return Err(RegistryError::MaxChannelsReached(self.config.max_channels));
        }

        match self.channels.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok((Arc::clone(entry.get()), false)),
            Entry::Vacant(entry) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let channel = Arc::new(Channel::new(name, seq));
                entry.insert(Arc::clone(&channel));
                info!(channel = %name, "Channel created");
                Ok((channel, true))
            }
        }
    }

    /// Remove the channel `name`, mark it unsubscribed and unbind its
    /// handlers.
    ///
    /// Returns the removed channel, or `None` if it did not exist.
    pub fn unsubscribe(&self, name: &str) -> Option<Arc<Channel>> {
        let (_, channel) = self.channels.remove(name)?;
        channel.mark_unsubscribed();
        channel.unbind_all();
        info!(channel = %name, "Channel removed");
        Some(channel)
    }

    /// Get a channel by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `channel` is the live entry for its name.
    #[must_use]
    pub fn is_current(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(channel.name())
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), channel))
    }

    /// Channels that still need a subscribe request, in request order.
    #[must_use]
    pub fn pending(&self) -> Vec<Arc<Channel>> {
        let mut pending: Vec<_> = self
            .channels
            .iter()
            .filter(|entry| entry.value().needs_request())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        pending.sort_by_key(|channel| channel.seq());
        pending
    }

    /// Put every channel back to pending after the connection was lost.
    pub fn reset_all(&self) {
        for entry in &self.channels {
            entry.value().reset();
        }
        trace!(channels = self.channels.len(), "Subscriptions reset");
    }

    /// Remove every channel.
    pub fn clear(&self) {
        for entry in &self.channels {
            entry.value().mark_unsubscribed();
            entry.value().unbind_all();
        }
        self.channels.clear();
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Get all channel names.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
