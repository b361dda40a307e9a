//! Channel authorization.
//!
//! Subscribing to a `private-` or `presence-` channel needs a token signed by
//! the application. The client asks an [`Authorizer`] for it once the
//! connection has a socket id.

use async_trait::async_trait;
use herald_protocol::AuthToken;
use thiserror::Error;

/// Authorization errors. Always scoped to one channel.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The client has no authorizer.
    #[error("No authorizer configured")]
    NotConfigured,

    /// The authorizer refused the channel.
    #[error("Authorization rejected with status {status}")]
    Rejected {
        /// Status reported by the auth endpoint.
        status: u16,
    },

    /// The request did not complete.
    #[error("Authorization request failed: {0}")]
    Request(String),

    /// The response could not be understood.
    #[error("Invalid authorization response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// Status to report to channel handlers.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status } => Some(*status),
            _ => None,
        }
    }
}

/// Provides auth tokens for protected channels.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Authorize `socket_id` to subscribe to `channel`.
    async fn authorize(&self, socket_id: &str, channel: &str) -> Result<AuthToken, AuthError>;
}

#[cfg(feature = "http")]
pub use http::HttpAuthorizer;

#[cfg(feature = "http")]
mod http {
    use super::{AuthError, Authorizer};
    use async_trait::async_trait;
    use herald_protocol::AuthToken;
    use reqwest::Client;
    use std::time::Duration;
    use tracing::debug;

    /// Authorizer posting `socket_id` and `channel_name` as a form to an
    /// application endpoint that answers with `{ "auth", "channel_data"? }`.
    #[derive(Debug, Clone)]
    pub struct HttpAuthorizer {
        client: Client,
        endpoint: String,
        headers: Vec<(String, String)>,
    }

    impl HttpAuthorizer {
        /// Create an authorizer for `endpoint`.
        #[must_use]
        pub fn new(endpoint: impl Into<String>) -> Self {
            let client = Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default();
            Self {
                client,
                endpoint: endpoint.into(),
                headers: Vec::new(),
            }
        }

        /// Send an extra header with every request.
        #[must_use]
        pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.headers.push((name.into(), value.into()));
            self
        }
    }

    #[async_trait]
    impl Authorizer for HttpAuthorizer {
        async fn authorize(&self, socket_id: &str, channel: &str) -> Result<AuthToken, AuthError> {
            debug!(%channel, endpoint = %self.endpoint, "Requesting channel authorization");

            let mut request = self
                .client
                .post(&self.endpoint)
                .form(&[("socket_id", socket_id), ("channel_name", channel)]);
            for (name, value) in &self.headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request
                .send()
                .await
                .map_err(|e| AuthError::Request(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(AuthError::Rejected {
                    status: status.as_u16(),
                });
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| AuthError::Request(e.to_string()))?;
            serde_json::from_slice(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_unreachable_endpoint() {
            let authorizer = HttpAuthorizer::new("http://127.0.0.1:9/auth").with_header("x-app", "test");
            let result = authorizer.authorize("1.1", "private-a").await;
            assert!(matches!(result, Err(AuthError::Request(_))));
        }
    }
}
