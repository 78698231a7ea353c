//! Framed TCP stream transport.
//!
//! Every connection carries length-delimited frames. The first frame is a
//! JSON [`Handshake`] with the stream-level metadata; the rest are relay
//! commands and replies.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue};
use relay_core::{Encoding, ProcessingContext, ServerStream, TransportError, WrappedStream};
use relay_node::Node;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::DropGuard,
};

use crate::interceptor::StreamInterceptor;

/// Transport name reported to handlers.
pub const STREAM_TRANSPORT: &str = "stream";

/// Time a client has to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// First frame of every stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Handshake {
    /// Stream-level metadata, read by identity resolvers. Keys are
    /// case-insensitive and must be unique.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Requested encoding, `json` when absent.
    #[serde(default)]
    pub encoding: Option<String>,
}

impl Handshake {
    fn header_map(&self) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::with_capacity(self.metadata.len());
        for (name, value) in &self.metadata {
            let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|e| TransportError::Handshake(format!("metadata key {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Handshake(format!("metadata value for {name}: {e}")))?;
            if headers.contains_key(&name) {
                return Err(TransportError::Handshake(format!(
                    "duplicate metadata key {name}"
                )));
            }
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

/// One accepted stream connection.
///
/// Its context is canceled when the stream is dropped.
pub struct TcpServerStream {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    context: ProcessingContext,
    metadata: HeaderMap,
    encoding: Encoding,
    peer: SocketAddr,
    _closed: DropGuard,
}

impl TcpServerStream {
    /// Read the handshake from a freshly accepted socket.
    ///
    /// # Errors
    /// Returns error if the handshake is missing, late or malformed.
    pub async fn accept(
        socket: TcpStream,
        peer: SocketAddr,
        max_frame_size: usize,
    ) -> Result<Self, TransportError> {
        let mut framed = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_size)
            .new_framed(socket);

        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| TransportError::Handshake("timed out".into()))?
            .ok_or_else(|| TransportError::Handshake("closed before handshake".into()))??;

        let handshake: Handshake = serde_json::from_slice(&frame)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let encoding = handshake
            .encoding
            .as_deref()
            .unwrap_or_default()
            .parse::<Encoding>()?;
        let metadata = handshake.header_map()?;

        let (context, closed) = ProcessingContext::new().scoped();
        Ok(Self {
            framed,
            context,
            metadata,
            encoding,
            peer,
            _closed: closed,
        })
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl ServerStream for TcpServerStream {
    fn context(&self) -> &ProcessingContext {
        &self.context
    }

    fn metadata(&self) -> &HeaderMap {
        &self.metadata
    }

    fn transport_name(&self) -> &'static str {
        STREAM_TRANSPORT
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    async fn recv_frame(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.framed
            .next()
            .await
            .map(|frame| frame.map(bytes::BytesMut::freeze).map_err(Into::into))
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.framed.send(frame).await.map_err(Into::into)
    }

    fn try_into_wrapped(self: Box<Self>) -> Result<Box<WrappedStream>, Box<dyn ServerStream>> {
        Err(self)
    }
}

/// Accept loop for the stream transport.
pub struct StreamServer {
    node: Node,
    interceptors: Vec<Arc<dyn StreamInterceptor>>,
    max_frame_size: usize,
}

impl StreamServer {
    #[must_use]
    pub fn new(node: Node) -> Self {
        let max_frame_size = node.config().max_frame_size;
        Self {
            node,
            interceptors: Vec::new(),
            max_frame_size,
        }
    }

    /// Add an interceptor. Interceptors run in registration order.
    #[must_use]
    pub fn with_interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: StreamInterceptor + 'static,
    {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Accept streams until the node begins shutting down.
    pub async fn serve(self, listener: TcpListener) {
        let server = Arc::new(self);
        let shutdown = server.node.shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Stream listener stopped");
                    return;
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Stream accept failed: {e}");
                            continue;
                        }
                    };
                    let server = Arc::clone(&server);
                    tokio::spawn(async move { server.handle(socket, peer).await });
                }
            }
        }
    }

    async fn handle(&self, socket: TcpStream, peer: SocketAddr) {
        let stream = match TcpServerStream::accept(socket, peer, self.max_frame_size).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(%peer, "Stream handshake failed: {e}");
                return;
            }
        };

        let mut stream: Box<dyn ServerStream> = Box::new(stream);
        for interceptor in &self.interceptors {
            stream = match interceptor.intercept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(%peer, "Stream rejected: {e}");
                    return;
                }
            };
        }

        if let Err(e) = self.node.serve(stream).await {
            tracing::debug!(%peer, "Stream session not admitted: {e}");
        }
    }
}
