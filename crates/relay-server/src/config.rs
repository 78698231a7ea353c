//! Server configuration from command line and environment.

use std::{net::IpAddr, net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use relay_core::{HeaderIdentity, IdentityResolver, StaticIdentity};
use relay_node::{
    NodeConfig,
    node::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_OUTBOX_CAPACITY},
};

use crate::handler::EventLogging;

/// Relay server configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "relay-server")]
#[command(about = "Real-time relay server with WebSocket and framed stream transports")]
pub struct Config {
    /// Address both listeners bind to
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port of the WebSocket listener (also serves metrics)
    #[arg(long, env = "RELAY_WEBSOCKET_PORT", default_value_t = 8000)]
    pub websocket_port: u16,

    /// Port of the framed stream listener
    #[arg(long, env = "RELAY_STREAM_PORT", default_value_t = 8001)]
    pub stream_port: u16,

    /// Path of the Prometheus scrape endpoint
    #[arg(long, env = "RELAY_METRICS_PATH", default_value = "/metrics")]
    pub metrics_path: String,

    /// Largest frame sent to or accepted from a client, in bytes
    #[arg(long, env = "RELAY_MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,

    /// Frames queued per client before it is disconnected as slow
    #[arg(long, env = "RELAY_CLIENT_QUEUE_SIZE", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub client_queue_size: usize,

    /// Admit clients with an empty user ID
    #[arg(long, env = "RELAY_CLIENT_ANONYMOUS")]
    pub client_anonymous: bool,

    /// Refuse publications from clients
    #[arg(long, env = "RELAY_DISABLE_PUBLISH")]
    pub disable_publish: bool,

    /// User ID given to every client when no identity header is configured
    #[arg(long, env = "RELAY_USER_ID", default_value = "42")]
    pub user_id: String,

    /// Resolve identity from this header or handshake metadata key instead
    #[arg(long, env = "RELAY_IDENTITY_HEADER")]
    pub identity_header: Option<String>,

    /// Seconds to wait for sessions to drain on shutdown (0 waits forever)
    #[arg(long, env = "RELAY_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Log unsubscribe events
    #[arg(long, env = "RELAY_LOG_UNSUBSCRIBE")]
    pub log_unsubscribe: bool,

    /// Log publish events
    #[arg(long, env = "RELAY_LOG_PUBLISH")]
    pub log_publish: bool,

    /// Log custom message events
    #[arg(long, env = "RELAY_LOG_MESSAGES")]
    pub log_messages: bool,
}

impl Config {
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            client_anonymous: self.client_anonymous,
            allow_publish: !self.disable_publish,
            max_frame_size: self.max_frame_size,
            outbox_capacity: self.client_queue_size,
            ..NodeConfig::default()
        }
    }

    #[must_use]
    pub const fn event_logging(&self) -> EventLogging {
        EventLogging {
            unsubscribe: self.log_unsubscribe,
            publish: self.log_publish,
            message: self.log_messages,
        }
    }

    /// `None` when the drain is unbounded.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Option<Duration> {
        match self.shutdown_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    #[must_use]
    pub const fn websocket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.websocket_port)
    }

    #[must_use]
    pub const fn stream_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.stream_port)
    }

    /// Identity resolver shared by both transports.
    ///
    /// # Errors
    /// Returns error if the identity header name is invalid.
    pub fn identity_resolver(&self) -> Result<Arc<dyn IdentityResolver>, ConfigError> {
        match &self.identity_header {
            Some(name) => {
                let header = name
                    .to_ascii_lowercase()
                    .parse()
                    .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
                Ok(Arc::new(HeaderIdentity::new(header)))
            }
            None => Ok(Arc::new(StaticIdentity::new(self.user_id.clone()))),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid identity header name: {0}")]
    InvalidHeader(String),
}

#[cfg(test)]
mod tests {
    use relay_core::ConnectAttempt;

    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("relay-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.websocket_port, 8000);
        assert_eq!(config.stream_port, 8001);
        assert_eq!(config.metrics_path, "/metrics");
        assert_eq!(config.shutdown_timeout(), Some(Duration::from_secs(30)));

        let node = config.node_config();
        assert!(node.allow_publish);
        assert!(!node.client_anonymous);
        assert_eq!(node.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(node.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);

        let logging = config.event_logging();
        assert!(!logging.unsubscribe && !logging.publish && !logging.message);
    }

    #[test]
    fn test_flags() {
        let config = parse(&[
            "--websocket-port",
            "9000",
            "--shutdown-timeout-secs",
            "0",
            "--disable-publish",
            "--log-publish",
            "--client-queue-size",
            "8",
        ]);
        assert_eq!(config.websocket_addr().port(), 9000);
        assert_eq!(config.shutdown_timeout(), None);
        assert!(!config.node_config().allow_publish);
        assert!(config.event_logging().publish);
        assert_eq!(config.node_config().outbox_capacity, 8);
    }

    #[tokio::test]
    async fn test_identity_resolver_selection() {
        let headers = http::HeaderMap::new();
        let attempt = || ConnectAttempt {
            transport: "test",
            metadata: &headers,
        };

        let resolver = parse(&[]).identity_resolver().unwrap();
        assert_eq!(resolver.resolve(attempt()).await.unwrap().user_id(), "42");

        let resolver = parse(&["--identity-header", "X-Auth-User"])
            .identity_resolver()
            .unwrap();
        assert!(resolver.resolve(attempt()).await.is_err());

        assert!(parse(&["--identity-header", "bad header"])
            .identity_resolver()
            .is_err());
    }
}
