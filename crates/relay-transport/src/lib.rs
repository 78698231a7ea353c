//! Transports that feed client streams into a relay node.
//!
//! Provides:
//! - Stream interceptors, including identity decoration
//! - WebSocket transport (feature: websocket)
//! - Framed TCP stream transport (feature: stream)

pub mod interceptor;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "stream")]
pub mod stream;

pub use interceptor::{AuthInterceptor, StreamInterceptor};

#[cfg(feature = "stream")]
pub use stream::{Handshake, StreamServer, TcpServerStream};

#[cfg(feature = "websocket")]
pub use websocket::{WsStream, authenticate, websocket_router, ws_handler};
