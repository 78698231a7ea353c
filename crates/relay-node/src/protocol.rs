//! Wire protocol for client-node communication.
//!
//! One JSON command per frame, tagged by `type`. Custom pushes sent through
//! [`crate::Client::send`] bypass this module and go out verbatim.

use std::{borrow::Cow, fmt};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command from client to node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Subscribe to a channel.
    Subscribe { channel: String },
    /// Unsubscribe from a channel.
    Unsubscribe { channel: String },
    /// Publish data into a channel.
    Publish { channel: String, data: Value },
    /// Custom point-to-point message.
    Message {
        #[serde(default)]
        data: Value,
    },
    /// Ping for keepalive.
    Ping,
}

impl Command {
    /// Decode a command from a frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a valid command.
    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

/// Reply from node to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Session accepted.
    Connected { client: String, user: String },
    /// Subscription accepted.
    Subscribed { channel: String },
    /// Unsubscription accepted.
    Unsubscribed { channel: String },
    /// Publication accepted.
    Published { channel: String },
    /// Pong response.
    Pong,
    /// Command failed, session continues.
    Error { code: u32, message: String },
    /// Session is being closed by the node.
    Disconnect { code: u32, reason: String },
}

impl Reply {
    /// Encode the reply as one frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

impl From<ReplyError> for Reply {
    fn from(e: ReplyError) -> Self {
        Self::Error {
            code: e.code,
            message: e.message.into_owned(),
        }
    }
}

impl From<&Disconnect> for Reply {
    fn from(d: &Disconnect) -> Self {
        Self::Disconnect {
            code: d.code,
            reason: d.reason.to_string(),
        }
    }
}

/// Error returned for a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    pub code: u32,
    pub message: Cow<'static, str>,
}

impl ReplyError {
    pub const INTERNAL: Self = Self::new_static(100, "internal server error");
    pub const UNAUTHORIZED: Self = Self::new_static(101, "unauthorized");
    pub const PERMISSION_DENIED: Self = Self::new_static(103, "permission denied");
    pub const BAD_REQUEST: Self = Self::new_static(107, "bad request");

    const fn new_static(code: u32, message: &'static str) -> Self {
        Self {
            code,
            message: Cow::Borrowed(message),
        }
    }

    #[must_use]
    pub fn new(code: u32, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Reason a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub code: u32,
    pub reason: Cow<'static, str>,
}

impl Disconnect {
    pub const NORMAL: Self = Self::new_static(3000, "normal");
    pub const SHUTDOWN: Self = Self::new_static(3001, "shutdown");
    pub const BAD_REQUEST: Self = Self::new_static(3003, "bad request");
    pub const SERVER_ERROR: Self = Self::new_static(3004, "internal server error");
    pub const UNAUTHORIZED: Self = Self::new_static(3005, "unauthorized");
    pub const CONNECTION_LOST: Self = Self::new_static(3006, "connection lost");
    /// The client did not drain its outbox fast enough.
    pub const SLOW: Self = Self::new_static(3008, "slow");

    const fn new_static(code: u32, reason: &'static str) -> Self {
        Self {
            code,
            reason: Cow::Borrowed(reason),
        }
    }

    #[must_use]
    pub fn new(code: u32, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}
