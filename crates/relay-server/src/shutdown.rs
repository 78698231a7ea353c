//! Graceful shutdown coordination.
//!
//! The coordinator is one-shot: [`ShutdownCoordinator::run`] consumes it,
//! waits for the termination signal, then drives the node through its drain.

use std::{future::Future, time::Duration};

use relay_node::Node;
use thiserror::Error;

/// Default time sessions get to drain.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown error.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Drain timed out after {timeout:?} with {remaining} sessions still open")]
    DrainTimeout { timeout: Duration, remaining: usize },
}

/// Stops the node on a termination signal and waits for the drain.
pub struct ShutdownCoordinator {
    node: Node,
    drain_timeout: Option<Duration>,
}

impl ShutdownCoordinator {
    /// `drain_timeout` of `None` waits for every session however long it
    /// takes.
    #[must_use]
    pub const fn new(node: Node, drain_timeout: Option<Duration>) -> Self {
        Self {
            node,
            drain_timeout,
        }
    }

    /// Wait for `signal`, then shut the node down.
    ///
    /// # Errors
    /// Returns error if sessions did not drain within the timeout.
    pub async fn run<F>(self, signal: F) -> Result<(), ShutdownError>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await
    }

    /// Shut the node down now.
    ///
    /// # Errors
    /// Returns error if sessions did not drain within the timeout.
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        tracing::info!(
            active = self.node.active_sessions(),
            timeout = ?self.drain_timeout,
            "shutting down"
        );

        let Some(timeout) = self.drain_timeout else {
            self.node.shutdown().await;
            return Ok(());
        };

        if tokio::time::timeout(timeout, self.node.shutdown()).await.is_err() {
            let remaining = self.node.active_sessions();
            tracing::warn!(remaining, "drain timed out after {timeout:?}");
            return Err(ShutdownError::DrainTimeout { timeout, remaining });
        }
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
