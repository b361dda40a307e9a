//! # herald-protocol
//!
//! Wire protocol definitions for the Herald realtime client.
//!
//! Every message is a [`Frame`] of the shape
//! `{ "event": string, "channel"?: string, "data": payload }`, carried as
//! JSON text or as length-prefixed MessagePack depending on the transport.
//!
//! ## Reserved events
//!
//! - `herald:connection_established` - Handshake from the service
//! - `herald_internal:subscription_succeeded` - Subscription acknowledgement
//! - `herald:subscription_error` / `herald:error` - Failures
//! - `herald:ping` / `herald:pong` - Keepalive
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{codec, Frame};
//!
//! let frame = Frame::subscribe("orders", None);
//!
//! let text = codec::encode_text(&frame).unwrap();
//! let decoded = codec::decode_text(&text).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, Encoding, ProtocolError, WireMessage};
pub use frames::{events, requires_auth, AuthToken, ConnectionEstablished, ErrorData, Frame, FrameKind};
pub use version::{Version, CLIENT_NAME, PROTOCOL_VERSION};
