//! Listener wiring for both transports.

use std::{io, net::SocketAddr, sync::Arc};

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::IdentityResolver;
use relay_node::Node;
use relay_transport::{AuthInterceptor, StreamServer, websocket_router};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{config::Config, metrics::metrics_router};

/// Scrape endpoint mounted on the WebSocket listener.
#[derive(Clone)]
pub struct MetricsEndpoint {
    pub path: String,
    pub handle: PrometheusHandle,
}

/// Bound listeners, one per transport.
pub struct Listeners {
    pub websocket: TcpListener,
    pub stream: TcpListener,
}

impl Listeners {
    /// Bind both listeners.
    ///
    /// # Errors
    /// Returns error if either address cannot be bound.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let websocket = bind(config.websocket_addr()).await?;
        let stream = bind(config.stream_addr()).await?;
        Ok(Self { websocket, stream })
    }
}

async fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| io::Error::new(e.kind(), format!("failed to bind {addr}: {e}")))
}

/// HTTP router: WebSocket upgrades plus the optional scrape endpoint.
#[must_use]
pub fn router(
    node: Node,
    resolver: Arc<dyn IdentityResolver>,
    metrics: Option<MetricsEndpoint>,
) -> Router {
    let mut app = websocket_router(node, resolver);
    if let Some(metrics) = metrics {
        app = app.merge(metrics_router(&metrics.path, metrics.handle));
    }
    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

/// Serve both transports until the node begins shutting down.
///
/// # Errors
/// Returns error if the HTTP server fails.
pub async fn serve(
    node: Node,
    listeners: Listeners,
    resolver: Arc<dyn IdentityResolver>,
    metrics: Option<MetricsEndpoint>,
) -> io::Result<()> {
    let app = router(node.clone(), resolver.clone(), metrics);
    let http = axum::serve(listeners.websocket, app).with_graceful_shutdown(node.shutdown_signal());

    let stream = StreamServer::new(node).with_interceptor(AuthInterceptor::new(resolver));

    let (http, ()) = tokio::join!(async move { http.await }, stream.serve(listeners.stream));
    http
}
