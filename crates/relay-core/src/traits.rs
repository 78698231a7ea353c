//! Core traits for bidirectional client streams.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ProcessingContext, WrappedStream, identity::AuthError};

/// Negotiated frame encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Encoding {
    /// UTF-8 JSON frames.
    #[default]
    Json,
}

impl Encoding {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "json" => Ok(Self::Json),
            other => Err(TransportError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
}

/// A bidirectional client stream as seen by the runtime.
///
/// The context is exposed through a getter only. Interception layers that
/// need to attach request-scoped values wrap the stream instead of mutating
/// it.
#[async_trait]
pub trait ServerStream: Send + 'static {
    /// Processing context of this stream.
    fn context(&self) -> &ProcessingContext;

    /// Request headers or handshake metadata sent by the client.
    fn metadata(&self) -> &HeaderMap;

    /// Transport name for logging.
    fn transport_name(&self) -> &'static str;

    /// Encoding negotiated at handshake.
    fn encoding(&self) -> Encoding;

    /// Receive the next frame. `None` once the peer has closed.
    async fn recv_frame(&mut self) -> Option<Result<Bytes, TransportError>>;

    /// Send one frame.
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Recover the wrapper if this stream already is one.
    ///
    /// Every stream except [`WrappedStream`] returns `Err(self)`.
    ///
    /// # Errors
    /// Returns the stream unchanged when it is not a wrapper.
    fn try_into_wrapped(self: Box<Self>) -> Result<Box<WrappedStream>, Box<dyn ServerStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_negotiation() {
        assert_eq!("json".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("".parse::<Encoding>().unwrap(), Encoding::Json);
        assert!(matches!(
            "protobuf".parse::<Encoding>(),
            Err(TransportError::UnsupportedEncoding(e)) if e == "protobuf"
        ));
    }

    #[test]
    fn test_encoding_display() {
        assert_eq!(Encoding::Json.to_string(), "json");
        assert_eq!(serde_json::to_string(&Encoding::Json).unwrap(), "\"json\"");
    }
}
