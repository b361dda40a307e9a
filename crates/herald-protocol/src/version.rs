//! Protocol revision spoken by this client.
//!
//! The revision travels in the query string of every transport URL. The
//! service refuses connections whose major revision it does not speak, so
//! only the major number is announced.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Revision implemented by this crate.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// Client identifier sent alongside the protocol revision.
pub const CLIENT_NAME: &str = "herald-rust";

/// A `major.minor` protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Query string identifying this client to the service.
    #[must_use]
    pub fn query(&self, client_version: &str) -> String {
        format!("protocol={}&client={CLIENT_NAME}&version={client_version}", self.major)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
