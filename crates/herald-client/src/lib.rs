//! # herald-client
//!
//! Realtime publish/subscribe client for Herald.
//!
//! This crate ties the protocol and the transports together:
//!
//! - **ConnectionMachine** - Sans-IO connection lifecycle with transport fallback
//! - **ChannelRegistry** - Channels, their subscription state and handlers
//! - **Dispatcher** - Routes inbound frames to handlers
//! - **Client** - The async driver and its handle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ commands ┌─────────────┐  frames  ┌─────────────┐
//! │   Client    │─────────▶│   Driver    │◀────────▶│  Transport  │
//! └─────────────┘          └─────────────┘          └─────────────┘
//!                             │       │
//!                             ▼       ▼
//!                   ┌───────────┐  ┌────────────┐   ┌──────────┐
//!                   │  Machine  │  │ Dispatcher │──▶│ Channels │
//!                   └───────────┘  └────────────┘   └──────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use herald_client::{Client, ClientConfig};
//!
//! # async fn run() -> Result<(), herald_client::ClientError> {
//! let client = Client::new(ClientConfig::new("app-key"))?;
//! let orders = client.subscribe("orders")?;
//! orders.bind("order_created", |data| println!("new order: {data}"));
//! client.connect()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod metrics;
pub mod registry;

pub use auth::{AuthError, Authorizer};
pub use channel::{Channel, ChannelId, HandlerId, SubscriptionState};
pub use client::{Client, ClientBuilder, ClientError, ConnectionInfo, STATE_CHANGE};
pub use config::{ClientConfig, ConfigError};
pub use connection::{ConnectionMachine, ConnectionState, ReconnectPolicy};
pub use dispatcher::{Dispatch, Dispatcher};
pub use registry::{ChannelRegistry, RegistryConfig, RegistryError};

#[cfg(feature = "http")]
pub use auth::HttpAuthorizer;
