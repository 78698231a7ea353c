//! Context-rewriting wrapper over a [`ServerStream`].

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

use crate::{Encoding, ProcessingContext, ServerStream, TransportError};

/// A stream whose context can be replaced.
///
/// [`ServerStream`] only exposes a context getter, so interceptors that
/// attach values wrap the stream and swap the context here. Every other
/// operation forwards to the wrapped stream.
pub struct WrappedStream {
    inner: Box<dyn ServerStream>,
    context: ProcessingContext,
}

impl WrappedStream {
    /// Wrap a stream, or hand back the existing wrapper unchanged.
    ///
    /// A fresh wrapper starts with the inner stream's context.
    #[must_use]
    pub fn wrap(stream: Box<dyn ServerStream>) -> Box<Self> {
        match stream.try_into_wrapped() {
            Ok(existing) => existing,
            Err(stream) => {
                let context = stream.context().clone();
                Box::new(Self {
                    inner: stream,
                    context,
                })
            }
        }
    }

    /// Replace the context returned by [`ServerStream::context`].
    pub fn set_context(&mut self, context: ProcessingContext) {
        self.context = context;
    }

    /// The wrapped stream.
    #[must_use]
    pub fn inner(&self) -> &dyn ServerStream {
        self.inner.as_ref()
    }
}

#[async_trait]
impl ServerStream for WrappedStream {
    fn context(&self) -> &ProcessingContext {
        &self.context
    }

    fn metadata(&self) -> &HeaderMap {
        self.inner.metadata()
    }

    fn transport_name(&self) -> &'static str {
        self.inner.transport_name()
    }

    fn encoding(&self) -> Encoding {
        self.inner.encoding()
    }

    async fn recv_frame(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.inner.recv_frame().await
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.inner.send_frame(frame).await
    }

    fn try_into_wrapped(self: Box<Self>) -> Result<Box<Self>, Box<dyn ServerStream>> {
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{Credentials, set_credentials};

    struct QueueStream {
        context: ProcessingContext,
        metadata: HeaderMap,
        incoming: VecDeque<Bytes>,
        sent: Vec<Bytes>,
    }

    impl QueueStream {
        fn boxed(incoming: &[&'static [u8]]) -> Box<dyn ServerStream> {
            Box::new(Self {
                context: ProcessingContext::new(),
                metadata: HeaderMap::new(),
                incoming: incoming.iter().map(|f| Bytes::from_static(*f)).collect(),
                sent: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl ServerStream for QueueStream {
        fn context(&self) -> &ProcessingContext {
            &self.context
        }

        fn metadata(&self) -> &HeaderMap {
            &self.metadata
        }

        fn transport_name(&self) -> &'static str {
            "queue"
        }

        fn encoding(&self) -> Encoding {
            Encoding::Json
        }

        async fn recv_frame(&mut self) -> Option<Result<Bytes, TransportError>> {
            self.incoming.pop_front().map(Ok)
        }

        async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
            self.sent.push(frame);
            Ok(())
        }

        fn try_into_wrapped(
            self: Box<Self>,
        ) -> Result<Box<WrappedStream>, Box<dyn ServerStream>> {
            Err(self)
        }
    }

    #[test]
    fn test_wrap_is_idempotent() {
        let first = WrappedStream::wrap(QueueStream::boxed(&[]));
        let first_ptr: *const WrappedStream = &*first;

        let second = WrappedStream::wrap(first);
        assert!(std::ptr::eq(first_ptr, &*second));
        assert_eq!(second.inner().transport_name(), "queue");
    }

    #[test]
    fn test_rewrap_keeps_replacement_context() {
        let mut wrapped = WrappedStream::wrap(QueueStream::boxed(&[]));
        let decorated = set_credentials(wrapped.context(), Credentials::new("42"));
        wrapped.set_context(decorated.clone());

        let rewrapped = WrappedStream::wrap(wrapped);
        assert!(rewrapped.context().shares_credentials_with(&decorated));
        assert!(rewrapped.inner().context().credentials().is_none());
    }

    #[tokio::test]
    async fn test_wrapper_forwards_io() {
        let mut wrapped = WrappedStream::wrap(QueueStream::boxed(&[b"one", b"two"]));
        wrapped.set_context(set_credentials(&ProcessingContext::new(), Credentials::new("42")));

        assert_eq!(wrapped.recv_frame().await.unwrap().unwrap(), "one");
        assert_eq!(wrapped.recv_frame().await.unwrap().unwrap(), "two");
        assert!(wrapped.recv_frame().await.is_none());

        tokio_test::assert_ok!(wrapped.send_frame(Bytes::from_static(b"out")).await);
        assert_eq!(wrapped.transport_name(), "queue");
        assert_eq!(wrapped.encoding(), Encoding::Json);
        assert_eq!(wrapped.context().user_id(), Some("42"));
    }
}
