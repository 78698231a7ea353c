//! Per-stream interception for the stream transport.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{
    ConnectAttempt, IdentityResolver, ServerStream, TransportError, WrappedStream, set_credentials,
};

/// Runs once per opened stream, before the node sees it.
#[async_trait]
pub trait StreamInterceptor: Send + Sync {
    /// Inspect or wrap a stream. `Err` closes the stream.
    async fn intercept(
        &self,
        stream: Box<dyn ServerStream>,
    ) -> Result<Box<dyn ServerStream>, TransportError>;
}

/// Resolves credentials from stream metadata and attaches them to the
/// stream's context through a [`WrappedStream`].
pub struct AuthInterceptor {
    resolver: Arc<dyn IdentityResolver>,
}

impl AuthInterceptor {
    #[must_use]
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl StreamInterceptor for AuthInterceptor {
    async fn intercept(
        &self,
        stream: Box<dyn ServerStream>,
    ) -> Result<Box<dyn ServerStream>, TransportError> {
        let attempt = ConnectAttempt {
            transport: stream.transport_name(),
            metadata: stream.metadata(),
        };
        let credentials = self.resolver.resolve(attempt).await?;

        let context = set_credentials(stream.context(), credentials);
        let mut wrapped = WrappedStream::wrap(stream);
        wrapped.set_context(context);
        Ok(wrapped)
    }
}
