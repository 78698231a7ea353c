//! Session runtime for relay.
//!
//! Provides:
//! - `Node` - Session admission, event dispatch and drain on shutdown
//! - `Client` - Handle to one connected client
//! - Lifecycle events and handler traits
//! - Wire protocol (JSON commands and replies)

pub mod client;
pub mod event;
pub mod node;
pub mod protocol;

pub use client::{Client, ClientId, SendError};
pub use event::{
    ConnectEvent, ConnectHandler, ConnectReply, DisconnectEvent, HandlerError, MessageEvent,
    MessageReply, PublishEvent, PublishReply, SessionHandler, SubscribeEvent, SubscribeReply,
    UnsubscribeEvent, UnsubscribeReply,
};
pub use node::{FatalError, Node, NodeConfig, NodeError};
pub use protocol::{Command, Disconnect, Reply, ReplyError};
