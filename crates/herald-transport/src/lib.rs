//! # herald-transport
//!
//! Transport layer for the Herald realtime client.
//!
//! This crate provides:
//!
//! - **Catalog** - Static descriptors of every transport and the
//!   [`Environment`] they are judged against
//! - **Negotiator** - Ordered, loadable candidate lists for one connection cycle
//! - **Transports** - WebSocket, HTTP streaming, HTTP polling and an
//!   in-memory transport for tests
//!
//! ## Transport Abstraction
//!
//! All transports implement the `Transport` and `Connection` traits,
//! allowing the client to be protocol-agnostic.
//!
//! ```rust,ignore
//! use herald_transport::{Connection, Endpoint, Transport};
//!
//! async fn pump(transport: &dyn Transport, endpoint: &Endpoint) {
//!     let mut conn = transport.open(endpoint).await.unwrap();
//!     while let Ok(Some(message)) = conn.recv().await {
//!         // Decode and dispatch
//!     }
//! }
//! ```

pub mod catalog;
pub mod memory;
pub mod negotiator;
pub mod traits;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use catalog::{
    standard, Capabilities, Capability, CapabilityCache, Environment, TransportCatalog,
    TransportDescriptor, TransportKind, TransportOptions,
};
pub use memory::{Behavior, MemoryListener, MemoryPeer, MemoryTransport};
pub use negotiator::{select_candidates, Candidate, LoadError, Negotiator, TransportLoader};
pub use traits::{Connection, Endpoint, SessionId, Transport, TransportError};

#[cfg(feature = "http")]
pub use http::{HttpPollingTransport, HttpStreamingTransport};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
