//! Relay server.
//!
//! Provides:
//! - `Config` - Command line and environment configuration
//! - `SessionLifecycle` - Handlers for every session event
//! - `ShutdownCoordinator` - Signal-driven drain of the node
//! - Listener wiring for the WebSocket and stream transports

pub mod config;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod shutdown;

pub use config::{Config, ConfigError};
pub use handler::{ECHO_PAYLOAD, EventLogging, SessionEvents, SessionLifecycle};
pub use server::{Listeners, MetricsEndpoint};
pub use shutdown::{ShutdownCoordinator, ShutdownError, wait_for_signal};
