//! Session lifecycle handlers.
//!
//! Every admitted session gets the same stateless [`SessionEvents`]. A custom
//! message is answered with [`ECHO_PAYLOAD`]. Failing to send it because the
//! session is already ending is ignored: the client left, or its outbox is
//! full and the node drops it as slow. Any other send failure is fatal and
//! takes the process down.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use relay_node::{
    Client, ConnectEvent, ConnectHandler, ConnectReply, Disconnect, DisconnectEvent,
    HandlerError, MessageEvent, MessageReply, PublishEvent, PublishReply, SessionHandler,
    SubscribeEvent, SubscribeReply, UnsubscribeEvent, UnsubscribeReply,
};

/// Fixed reply to every custom message.
pub const ECHO_PAYLOAD: &[u8] = br#"{"_id":"5adece493c1a23736b037c52","address":"768 Paerdegat Avenue, Gouglersville, Oklahoma, 5380","age":25,"balance":"$2,199.02","company":"SHADEASE","email":"swansonwalker@shadease.com","eyeColor":"blue","favoriteFruit":"apple","gender":"male","greeting":"Hello, Swanson Walker! You have 9 unread messages.","isActive":false,"latitude":-71.336378,"longitude":-28.155956,"name":"Swanson Walker","phone":"+1 (885) 410-3991","picture":"http://placehold.it/32x32","registered":"2016-01-24T07:40:09 -03:00","tags":["magna","nostrud","irure","aliquip","culpa","sint"]}"#;

/// Logging switches for high-volume events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventLogging {
    pub unsubscribe: bool,
    pub publish: bool,
    pub message: bool,
}

/// Connect handler registered on the node.
pub struct SessionLifecycle {
    events: Arc<SessionEvents>,
}

impl SessionLifecycle {
    #[must_use]
    pub fn new(logging: EventLogging) -> Self {
        Self {
            events: Arc::new(SessionEvents {
                logging,
                echo: Bytes::from_static(ECHO_PAYLOAD),
            }),
        }
    }
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new(EventLogging::default())
    }
}

#[async_trait]
impl ConnectHandler for SessionLifecycle {
    async fn on_connect(
        &self,
        client: &Client,
        event: ConnectEvent,
    ) -> Result<ConnectReply, Disconnect> {
        tracing::info!(
            client = %client.id(),
            user = client.user_id(),
            transport = event.transport,
            encoding = %event.encoding,
            "user connected"
        );
        Ok(ConnectReply::new(self.events.clone()))
    }
}

/// Per-session handlers shared by all sessions.
pub struct SessionEvents {
    logging: EventLogging,
    echo: Bytes,
}

#[async_trait]
impl SessionHandler for SessionEvents {
    async fn on_subscribe(
        &self,
        client: &Client,
        event: &SubscribeEvent,
    ) -> Result<SubscribeReply, HandlerError> {
        tracing::info!(
            user = client.user_id(),
            channel = %event.channel,
            "user subscribes"
        );
        Ok(SubscribeReply)
    }

    async fn on_unsubscribe(&self, client: &Client, event: &UnsubscribeEvent) -> UnsubscribeReply {
        if self.logging.unsubscribe {
            tracing::info!(user = client.user_id(), channel = %event.channel, "user unsubscribed");
        }
        UnsubscribeReply
    }

    async fn on_publish(
        &self,
        client: &Client,
        event: &PublishEvent,
    ) -> Result<PublishReply, HandlerError> {
        if self.logging.publish {
            tracing::info!(user = client.user_id(), channel = %event.channel, "publication");
        }
        Ok(PublishReply)
    }

    async fn on_message(
        &self,
        client: &Client,
        _event: &MessageEvent,
    ) -> Result<MessageReply, HandlerError> {
        if self.logging.message {
            tracing::info!(user = client.user_id(), "message");
        }

        match client.send(self.echo.clone()) {
            Ok(()) => Ok(MessageReply),
            Err(e) if e.is_session_ending() => {
                tracing::debug!(client = %client.id(), "echo dropped: {e}");
                Ok(MessageReply)
            }
            Err(e) => Err(HandlerError::Fatal(format!("error sending to client: {e}"))),
        }
    }

    async fn on_disconnect(&self, client: &Client, event: &DisconnectEvent) {
        tracing::info!(
            client = %client.id(),
            user = client.user_id(),
            reason = %event.disconnect,
            "user disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use futures::{SinkExt, StreamExt};
    use relay_core::StaticIdentity;
    use relay_node::{Node, NodeConfig, Reply};
    use relay_transport::{AuthInterceptor, StreamServer};
    use serde_json::{Value, json};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    use super::*;

    type Conn = Framed<TcpStream, LengthDelimitedCodec>;

    async fn start(config: NodeConfig, logging: EventLogging) -> (Node, SocketAddr) {
        let node = Node::new(config).unwrap();
        node.on_connect(SessionLifecycle::new(logging)).unwrap();
        node.run().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = StreamServer::new(node.clone())
            .with_interceptor(AuthInterceptor::new(Arc::new(StaticIdentity::new("42"))));
        tokio::spawn(server.serve(listener));
        (node, addr)
    }

    async fn connect(addr: SocketAddr) -> Conn {
        let socket = TcpStream::connect(addr).await.unwrap();
        let mut conn = Framed::new(socket, LengthDelimitedCodec::new());
        conn.send(Bytes::from_static(b"{}")).await.unwrap();
        let connected = recv(&mut conn).await;
        assert_eq!(connected["type"], "connected");
        conn
    }

    async fn send(conn: &mut Conn, command: &Value) {
        conn.send(Bytes::from(command.to_string())).await.unwrap();
    }

    async fn recv_raw(conn: &mut Conn) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), conn.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .freeze()
    }

    async fn recv(conn: &mut Conn) -> Value {
        serde_json::from_slice(&recv_raw(conn).await).unwrap()
    }

    #[test]
    fn test_echo_payload_is_json() {
        let value: Value = serde_json::from_slice(ECHO_PAYLOAD).unwrap();
        assert_eq!(value["name"], "Swanson Walker");
        assert_eq!(value["tags"].as_array().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_message_echoes_payload() {
        let (_node, addr) = start(NodeConfig::default(), EventLogging::default()).await;
        let mut conn = connect(addr).await;

        send(&mut conn, &json!({"type": "message", "data": {"hello": "world"}})).await;
        assert_eq!(recv_raw(&mut conn).await, ECHO_PAYLOAD);

        send(&mut conn, &json!({"type": "ping"})).await;
        assert_eq!(recv(&mut conn).await, json!({"type": "pong"}));
    }

    #[tokio::test]
    async fn test_lifecycle_replies() {
        let logging = EventLogging {
            unsubscribe: true,
            publish: true,
            message: true,
        };
        let (_node, addr) = start(NodeConfig::default(), logging).await;
        let mut conn = connect(addr).await;

        send(&mut conn, &json!({"type": "subscribe", "channel": "news"})).await;
        assert_eq!(recv(&mut conn).await, json!({"type": "subscribed", "channel": "news"}));

        send(
            &mut conn,
            &json!({"type": "publish", "channel": "news", "data": {"n": 1}}),
        )
        .await;
        assert_eq!(recv(&mut conn).await, json!({"type": "published", "channel": "news"}));

        send(&mut conn, &json!({"type": "unsubscribe", "channel": "news"})).await;
        assert_eq!(
            recv(&mut conn).await,
            json!({"type": "unsubscribed", "channel": "news"})
        );
    }

    #[tokio::test]
    async fn test_concurrent_subscribers() {
        let (_node, addr) = start(NodeConfig::default(), EventLogging::default()).await;
        let (mut first, mut second) = tokio::join!(connect(addr), connect(addr));

        let subscribe = json!({"type": "subscribe", "channel": "room"});
        tokio::join!(send(&mut first, &subscribe), send(&mut second, &subscribe));
        let (a, b) = tokio::join!(recv(&mut first), recv(&mut second));

        let expected = json!({"type": "subscribed", "channel": "room"});
        assert_eq!(a, expected);
        assert_eq!(b, expected);
    }

    #[tokio::test]
    async fn test_oversized_echo_is_fatal() {
        let config = NodeConfig {
            max_frame_size: 256,
            ..NodeConfig::default()
        };
        let (node, addr) = start(config, EventLogging::default()).await;

        // Replies fit, the echo payload does not.
        let mut conn = connect(addr).await;
        send(&mut conn, &json!({"type": "message"})).await;

        let fatal = tokio::time::timeout(Duration::from_secs(5), node.fatal_error())
            .await
            .unwrap();
        assert!(fatal.message.contains("error sending to client"));

        let reply: Reply = serde_json::from_value(recv(&mut conn).await).unwrap();
        assert_eq!(reply, Reply::from(&Disconnect::SERVER_ERROR));
    }
}
