//! Session lifecycle events, replies and handler traits.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::Encoding;
use serde_json::Value;
use thiserror::Error;

use crate::{
    Client,
    protocol::{Disconnect, ReplyError},
};

/// Fired once per session after identity is attached.
#[derive(Debug, Clone)]
pub struct ConnectEvent {
    pub transport: &'static str,
    pub encoding: Encoding,
}

#[derive(Debug, Clone)]
pub struct SubscribeEvent {
    pub channel: String,
}

#[derive(Debug, Clone)]
pub struct UnsubscribeEvent {
    pub channel: String,
}

#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub channel: String,
    pub data: Value,
}

/// Custom point-to-point frame from a client.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: Value,
}

/// Terminal event of a session.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub disconnect: Disconnect,
}

/// Accepted connection, carrying the handlers for the rest of the session.
pub struct ConnectReply {
    handler: Arc<dyn SessionHandler>,
}

impl ConnectReply {
    /// Accept the connection and attach session handlers.
    #[must_use]
    pub fn new(handler: Arc<dyn SessionHandler>) -> Self {
        Self { handler }
    }

    pub(crate) fn into_handler(self) -> Arc<dyn SessionHandler> {
        self.handler
    }
}

/// Subscription accepted without channel-specific options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeReply;

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsubscribeReply;

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishReply;

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageReply;

/// Handler error.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Refuse this command; the session continues.
    #[error("Rejected: {0}")]
    Reject(ReplyError),
    /// Unrecoverable; the process is expected to abort.
    #[error("Fatal: {0}")]
    Fatal(String),
}

/// Entry point invoked by the node for every admitted session.
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    /// Accept the session with its handlers, or reject it.
    async fn on_connect(
        &self,
        client: &Client,
        event: ConnectEvent,
    ) -> Result<ConnectReply, Disconnect>;
}

/// Per-session event handlers, one method per event.
///
/// Calls for one session are sequential. Calls for different sessions run
/// concurrently, so implementations must not hold unsynchronized state.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn on_subscribe(
        &self,
        _client: &Client,
        _event: &SubscribeEvent,
    ) -> Result<SubscribeReply, HandlerError> {
        Ok(SubscribeReply)
    }

    async fn on_unsubscribe(&self, _client: &Client, _event: &UnsubscribeEvent) -> UnsubscribeReply {
        UnsubscribeReply
    }

    async fn on_publish(
        &self,
        _client: &Client,
        _event: &PublishEvent,
    ) -> Result<PublishReply, HandlerError> {
        Ok(PublishReply)
    }

    async fn on_message(
        &self,
        _client: &Client,
        _event: &MessageEvent,
    ) -> Result<MessageReply, HandlerError> {
        Ok(MessageReply)
    }

    async fn on_disconnect(&self, _client: &Client, _event: &DisconnectEvent) {}
}
