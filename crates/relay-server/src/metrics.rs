//! Prometheus recorder and scrape endpoint.

use axum::{Router, extract::State, routing::get};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder.
///
/// Must run once, before the node records anything.
///
/// # Errors
/// Returns error if a global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    tracing::info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Router serving the Prometheus text format at `path`.
#[must_use]
pub fn metrics_router(path: &str, handle: PrometheusHandle) -> Router {
    Router::new()
        .route(path, get(render))
        .with_state(handle)
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
