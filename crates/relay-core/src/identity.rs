//! Identity resolution for inbound connection attempts.

use async_trait::async_trait;
use http::{HeaderMap, HeaderName};
use thiserror::Error;

use crate::Credentials;

/// Default metadata header read by [`HeaderIdentity`].
pub const USER_ID_HEADER: &str = "x-user-id";

/// An inbound connection attempt on either transport.
#[derive(Debug, Clone, Copy)]
pub struct ConnectAttempt<'a> {
    /// Transport name (`websocket`, `stream`).
    pub transport: &'static str,
    /// Request headers or stream handshake metadata.
    pub metadata: &'a HeaderMap,
}

/// Identity resolution error.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("Connection rejected: {0}")]
    Rejected(String),
}

/// Trait for resolving credentials of a connecting client.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve credentials for a connection attempt.
    async fn resolve(&self, attempt: ConnectAttempt<'_>) -> Result<Credentials, AuthError>;
}

/// Resolver that authenticates every client as the same user.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    user_id: String,
}

impl StaticIdentity {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve(&self, _attempt: ConnectAttempt<'_>) -> Result<Credentials, AuthError> {
        Ok(Credentials::new(self.user_id.clone()))
    }
}

/// Resolver that reads the user ID from a metadata header.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header: HeaderName,
}

impl HeaderIdentity {
    #[must_use]
    pub const fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Default for HeaderIdentity {
    fn default() -> Self {
        Self::new(HeaderName::from_static(USER_ID_HEADER))
    }
}

#[async_trait]
impl IdentityResolver for HeaderIdentity {
    async fn resolve(&self, attempt: ConnectAttempt<'_>) -> Result<Credentials, AuthError> {
        let Some(value) = attempt.metadata.get(&self.header) else {
            tracing::debug!(transport = attempt.transport, header = %self.header, "identity header missing");
            return Err(AuthError::MissingCredentials(self.header.to_string()));
        };

        let user_id = value
            .to_str()
            .map_err(|e| AuthError::InvalidCredentials(format!("{}: {e}", self.header)))?;

        Ok(Credentials::new(user_id))
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn attempt(metadata: &HeaderMap) -> ConnectAttempt<'_> {
        ConnectAttempt {
            transport: "stream",
            metadata,
        }
    }

    #[tokio::test]
    async fn test_static_identity_ignores_metadata() {
        let mut metadata = HeaderMap::new();
        metadata.insert(USER_ID_HEADER, HeaderValue::from_static("7"));

        let creds = StaticIdentity::new("42")
            .resolve(attempt(&metadata))
            .await
            .unwrap();
        assert_eq!(creds.user_id(), "42");
    }

    #[tokio::test]
    async fn test_header_identity_reads_header() {
        let mut metadata = HeaderMap::new();
        metadata.insert(USER_ID_HEADER, HeaderValue::from_static("alice"));

        let creds = HeaderIdentity::default()
            .resolve(attempt(&metadata))
            .await
            .unwrap();
        assert_eq!(creds.user_id(), "alice");
    }

    #[tokio::test]
    async fn test_header_identity_missing_header() {
        let metadata = HeaderMap::new();
        let result = HeaderIdentity::default().resolve(attempt(&metadata)).await;
        assert!(matches!(result, Err(AuthError::MissingCredentials(h)) if h == USER_ID_HEADER));
    }

    #[tokio::test]
    async fn test_header_identity_rejects_opaque_value() {
        let mut metadata = HeaderMap::new();
        metadata.insert(USER_ID_HEADER, HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap());

        let result = HeaderIdentity::default().resolve(attempt(&metadata)).await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials(_))));
    }
}
