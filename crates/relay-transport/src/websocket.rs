//! WebSocket transport for relay clients.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Extension, Router,
    extract::{
        Query, Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use relay_core::{
    ConnectAttempt, Encoding, IdentityResolver, ProcessingContext, ServerStream, TransportError,
    WrappedStream, set_credentials,
};
use relay_node::Node;
use serde::Deserialize;
use tokio_util::sync::DropGuard;

/// Transport name reported to handlers.
pub const WEBSOCKET_TRANSPORT: &str = "websocket";

/// Route the upgrade handler is mounted on.
pub const WEBSOCKET_PATH: &str = "/connection/websocket";

/// Upgrade request query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Requested encoding, `json` when absent.
    #[serde(default)]
    pub format: Option<String>,
}

/// Middleware resolving the caller's identity.
///
/// Decorates the request's [`ProcessingContext`] extension (a fresh one if
/// none is present) and forwards the request. Resolution failures answer
/// `401 Unauthorized`.
pub async fn authenticate(
    State(resolver): State<Arc<dyn IdentityResolver>>,
    mut req: Request,
    next: Next,
) -> Response {
    let attempt = ConnectAttempt {
        transport: WEBSOCKET_TRANSPORT,
        metadata: req.headers(),
    };
    let credentials = match resolver.resolve(attempt).await {
        Ok(credentials) => credentials,
        Err(e) => {
            tracing::warn!("WebSocket authentication failed: {e}");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let base = req
        .extensions()
        .get::<ProcessingContext>()
        .cloned()
        .unwrap_or_default();
    req.extensions_mut()
        .insert(set_credentials(&base, credentials));

    next.run(req).await
}

/// WebSocket upgrade handler.
///
/// Must sit behind [`authenticate`], which provides the decorated context.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(node): State<Node>,
    Query(params): Query<WsParams>,
    Extension(context): Extension<ProcessingContext>,
    headers: HeaderMap,
) -> Response {
    let encoding = match params.format.as_deref().unwrap_or_default().parse::<Encoding>() {
        Ok(encoding) => encoding,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let stream = WsStream::new(socket, &context, headers, encoding);
        if let Err(e) = node.serve(Box::new(stream)).await {
            tracing::debug!("WebSocket session not admitted: {e}");
        }
    })
}

/// Create the WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(websocket_router(node, Arc::new(StaticIdentity::new("42"))));
/// ```
#[must_use]
pub fn websocket_router(node: Node, resolver: Arc<dyn IdentityResolver>) -> Router {
    Router::new()
        .route(WEBSOCKET_PATH, get(ws_handler))
        .route_layer(middleware::from_fn_with_state(resolver, authenticate))
        .with_state(node)
}

/// An upgraded WebSocket connection.
///
/// Its context is canceled when the stream is dropped.
pub struct WsStream {
    socket: WebSocket,
    context: ProcessingContext,
    metadata: HeaderMap,
    encoding: Encoding,
    _closed: DropGuard,
}

impl WsStream {
    #[must_use]
    pub fn new(
        socket: WebSocket,
        context: &ProcessingContext,
        metadata: HeaderMap,
        encoding: Encoding,
    ) -> Self {
        let (context, closed) = context.scoped();
        Self {
            socket,
            context,
            metadata,
            encoding,
            _closed: closed,
        }
    }
}

#[async_trait]
impl ServerStream for WsStream {
    fn context(&self) -> &ProcessingContext {
        &self.context
    }

    fn metadata(&self) -> &HeaderMap {
        &self.metadata
    }

    fn transport_name(&self) -> &'static str {
        WEBSOCKET_TRANSPORT
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    async fn recv_frame(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => {
                    return Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes())));
                }
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Io(std::io::Error::other(e)))),
            }
        }
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))
    }

    fn try_into_wrapped(self: Box<Self>) -> Result<Box<WrappedStream>, Box<dyn ServerStream>> {
        Err(self)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use relay_core::{HeaderIdentity, StaticIdentity};
    use relay_node::{
        Client, ConnectEvent, ConnectHandler, ConnectReply, Disconnect, NodeConfig, Reply,
        SessionHandler,
    };
    use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};

    use super::*;

    struct AcceptAll;

    #[async_trait]
    impl ConnectHandler for AcceptAll {
        async fn on_connect(
            &self,
            _client: &Client,
            _event: ConnectEvent,
        ) -> Result<ConnectReply, Disconnect> {
            Ok(ConnectReply::new(Arc::new(Self)))
        }
    }

    impl SessionHandler for AcceptAll {}

    async fn start(resolver: Arc<dyn IdentityResolver>) -> (Node, SocketAddr) {
        let node = Node::new(NodeConfig::default()).unwrap();
        node.on_connect(AcceptAll).unwrap();
        node.run().unwrap();

        let app = websocket_router(node.clone(), resolver);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (node, addr)
    }

    fn url(addr: SocketAddr, query: &str) -> String {
        format!("ws://{addr}{WEBSOCKET_PATH}{query}")
    }

    #[tokio::test]
    async fn test_upgrade_attaches_identity() {
        let (_node, addr) = start(Arc::new(StaticIdentity::new("42"))).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url(addr, "")).await.unwrap();

        let msg = ws.next().await.unwrap().unwrap();
        let reply: Reply = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
        assert!(matches!(reply, Reply::Connected { user, .. } if user == "42"));

        ws.send(tungstenite::Message::text(r#"{"type":"ping"}"#))
            .await
            .unwrap();
        let msg = ws.next().await.unwrap().unwrap();
        let reply: Reply = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
        assert_eq!(reply, Reply::Pong);
    }

    #[tokio::test]
    async fn test_upgrade_reads_identity_header() {
        let (_node, addr) = start(Arc::new(HeaderIdentity::default())).await;

        let mut request = url(addr, "").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("x-user-id", "alice".parse().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        let msg = ws.next().await.unwrap().unwrap();
        let reply: Reply = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
        assert!(matches!(reply, Reply::Connected { user, .. } if user == "alice"));
    }

    #[tokio::test]
    async fn test_upgrade_without_identity_is_unauthorized() {
        let (_node, addr) = start(Arc::new(HeaderIdentity::default())).await;

        let err = tokio_tungstenite::connect_async(url(addr, "")).await.unwrap_err();
        match err {
            tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED.as_u16());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_upgrade_rejects_unknown_format() {
        let (_node, addr) = start(Arc::new(StaticIdentity::new("42"))).await;

        let err = tokio_tungstenite::connect_async(url(addr, "?format=protobuf"))
            .await
            .unwrap_err();
        match err {
            tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST.as_u16());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Hands out the session context on connect and again from a message
    /// handler that stays busy until the context is canceled.
    #[derive(Clone)]
    struct WatchContext {
        contexts: tokio::sync::mpsc::UnboundedSender<ProcessingContext>,
    }

    #[async_trait]
    impl ConnectHandler for WatchContext {
        async fn on_connect(
            &self,
            client: &Client,
            _event: ConnectEvent,
        ) -> Result<ConnectReply, Disconnect> {
            let _ = self.contexts.send(client.context().clone());
            Ok(ConnectReply::new(Arc::new(self.clone())))
        }
    }

    #[async_trait]
    impl SessionHandler for WatchContext {
        async fn on_message(
            &self,
            client: &Client,
            _event: &relay_node::MessageEvent,
        ) -> Result<relay_node::MessageReply, relay_node::HandlerError> {
            let _ = self.contexts.send(client.context().clone());
            let _ = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                client.context().cancelled(),
            )
            .await;
            Ok(relay_node::MessageReply)
        }
    }

    #[tokio::test]
    async fn test_session_context_cancelled_when_socket_closes() {
        let (contexts, mut observed) = tokio::sync::mpsc::unbounded_channel();
        let node = Node::new(NodeConfig::default()).unwrap();
        node.on_connect(WatchContext { contexts }).unwrap();
        node.run().unwrap();

        let app = websocket_router(node.clone(), Arc::new(StaticIdentity::new("42")));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(url(addr, "")).await.unwrap();
        ws.next().await.unwrap().unwrap();
        let session = observed.recv().await.unwrap();
        assert_eq!(session.user_id(), Some("42"));

        ws.send(tungstenite::Message::text(r#"{"type":"message"}"#))
            .await
            .unwrap();
        let in_flight = observed.recv().await.unwrap();
        assert!(!in_flight.is_cancelled());

        ws.close(None).await.unwrap();
        drop(ws);
        tokio::time::timeout(std::time::Duration::from_secs(5), in_flight.cancelled())
            .await
            .unwrap();
        assert!(session.is_cancelled());
    }
}
