//! Session runtime: admission, per-session event dispatch and drain.

use std::{
    collections::VecDeque,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use relay_core::{ServerStream, TransportError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFutureOwned},
    task::TaskTracker,
};

use crate::{
    Client,
    client::{ClientId, Outbox},
    event::{
        ConnectEvent, ConnectHandler, DisconnectEvent, HandlerError, MessageEvent, PublishEvent,
        SessionHandler, SubscribeEvent, UnsubscribeEvent,
    },
    protocol::{Command, Disconnect, Reply, ReplyError},
};

/// Default maximum frame size (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default number of frames a client may have queued.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Frames read ahead while a handler is still running.
const MAX_PENDING_FRAMES: usize = 64;

/// Static node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node name used in logs.
    pub name: String,
    /// Admit clients whose credentials carry an empty user ID.
    pub client_anonymous: bool,
    /// Accept publications from clients.
    pub allow_publish: bool,
    /// Largest frame a client may be sent.
    pub max_frame_size: usize,
    /// Frames a client may have queued before it is disconnected as slow.
    pub outbox_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "relay".to_string(),
            client_anonymous: false,
            allow_publish: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

/// Node error.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Connect handler already registered")]
    HandlerAlreadySet,
    #[error("No connect handler registered")]
    NoConnectHandler,
    #[error("Node is not running")]
    NotRunning,
    #[error("Node is already running")]
    AlreadyRunning,
    #[error("Node is shutting down")]
    ShuttingDown,
    #[error("Client is not authenticated")]
    Unauthenticated,
    #[error("Connection rejected: {0}")]
    Rejected(Disconnect),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Unrecoverable error raised by a session handler.
#[derive(Debug, Clone, Error)]
#[error("fatal error in session of client {client}: {message}")]
pub struct FatalError {
    pub client: ClientId,
    pub message: String,
}

struct Inner {
    config: NodeConfig,
    connect_handler: OnceLock<Arc<dyn ConnectHandler>>,
    running: AtomicBool,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    fatal: watch::Sender<Option<FatalError>>,
}

/// Handle to the running node, cheap to clone.
///
/// Constructed once at startup and passed to every component that needs it.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    /// Create a new node.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        if config.max_frame_size == 0 {
            return Err(NodeError::Config("max_frame_size must be positive".into()));
        }
        if config.outbox_capacity == 0 {
            return Err(NodeError::Config("outbox_capacity must be positive".into()));
        }

        let (fatal, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connect_handler: OnceLock::new(),
                running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                sessions: TaskTracker::new(),
                fatal,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Register the connect handler.
    ///
    /// # Errors
    /// Returns error if a handler is already registered.
    pub fn on_connect<H>(&self, handler: H) -> Result<(), NodeError>
    where
        H: ConnectHandler + 'static,
    {
        self.inner
            .connect_handler
            .set(Arc::new(handler))
            .map_err(|_| NodeError::HandlerAlreadySet)
    }

    /// Start admitting sessions.
    ///
    /// # Errors
    /// Returns error if no handler is registered, the node already runs, or
    /// shutdown has begun.
    pub fn run(&self) -> Result<(), NodeError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(NodeError::ShuttingDown);
        }
        if self.inner.connect_handler.get().is_none() {
            return Err(NodeError::NoConnectHandler);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyRunning);
        }
        tracing::info!(node = %self.inner.config.name, "node running");
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of sessions currently being served.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Resolves once shutdown has begun. Listeners stop accepting on it.
    #[must_use]
    pub fn shutdown_signal(&self) -> WaitForCancellationFutureOwned {
        self.inner.shutdown.clone().cancelled_owned()
    }

    /// Stop admitting sessions, disconnect the open ones and wait until
    /// every session has finished.
    ///
    /// Session contexts are canceled right away, including those of
    /// sessions whose handlers are still running.
    pub async fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!(
                node = %self.inner.config.name,
                active = self.active_sessions(),
                "node shutting down"
            );
        }
        self.inner.shutdown.cancel();
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.sessions.close();
        self.inner.sessions.wait().await;
        tracing::info!(node = %self.inner.config.name, "node stopped");
    }

    /// Resolves with the first fatal error raised by any session handler.
    pub async fn fatal_error(&self) -> FatalError {
        let mut rx = self.inner.fatal.subscribe();
        let error = {
            let slot = rx.wait_for(Option::is_some).await;
            slot.ok().and_then(|s| (*s).clone())
        };
        match error {
            Some(error) => error,
            None => std::future::pending().await,
        }
    }

    /// Serve one client stream until it disconnects.
    ///
    /// The stream's context must already carry credentials. Both transports
    /// hand their streams here once identity is attached.
    ///
    /// # Errors
    /// Returns error if the session is not admitted.
    pub async fn serve(&self, stream: Box<dyn ServerStream>) -> Result<(), NodeError> {
        let this = self.clone();
        self.inner
            .sessions
            .track_future(async move { this.drive(stream).await })
            .await
    }

    async fn drive(&self, mut stream: Box<dyn ServerStream>) -> Result<(), NodeError> {
        if self.inner.shutdown.is_cancelled() {
            reject(stream.as_mut(), &Disconnect::SHUTDOWN).await;
            return Err(NodeError::ShuttingDown);
        }
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }
        let handler = self
            .inner
            .connect_handler
            .get()
            .cloned()
            .ok_or(NodeError::NoConnectHandler)?;

        // The session context is canceled on every exit path.
        let (ctx, cancel) = stream.context().child();
        let _cancel_on_exit = cancel.clone().drop_guard();
        let credentials = match ctx.credentials() {
            Some(c) if !c.is_anonymous() || self.inner.config.client_anonymous => c.clone(),
            _ => {
                tracing::debug!(transport = stream.transport_name(), "unauthenticated client");
                reject(stream.as_mut(), &Disconnect::UNAUTHORIZED).await;
                return Err(NodeError::Unauthenticated);
            }
        };

        let transport = stream.transport_name();
        let encoding = stream.encoding();
        let capacity = self.inner.config.outbox_capacity;
        let (sender, mut outbound_rx) = mpsc::channel(capacity);
        let client = Client::new(
            credentials,
            transport,
            encoding,
            ctx,
            cancel,
            Outbox {
                sender,
                capacity,
                max_frame_size: self.inner.config.max_frame_size,
            },
        );

        let connecting = handler.on_connect(&client, ConnectEvent { transport, encoding });
        let admitted = tokio::select! {
            biased;
            () = self.inner.shutdown.cancelled() => None,
            result = connecting => Some(result),
        };
        let session = match admitted {
            Some(Ok(reply)) if !self.inner.shutdown.is_cancelled() => reply.into_handler(),
            Some(Err(disconnect)) => {
                tracing::warn!(client = %client.id(), user = client.user_id(), %disconnect, "connection rejected");
                reject(stream.as_mut(), &disconnect).await;
                return Err(NodeError::Rejected(disconnect));
            }
            _ => {
                tracing::debug!(client = %client.id(), "shutdown began while connecting");
                client.close();
                reject(stream.as_mut(), &Disconnect::SHUTDOWN).await;
                return Err(NodeError::ShuttingDown);
            }
        };

        metrics::counter!("relay_connections_total", "transport" => transport).increment(1);
        metrics::gauge!("relay_sessions_active").increment(1.0);

        let connected = Reply::Connected {
            client: client.id().to_string(),
            user: client.user_id().to_string(),
        };
        let disconnect = match write_reply(stream.as_mut(), &connected).await {
            Ok(()) => {
                self.session_loop(stream.as_mut(), &client, session.as_ref(), &mut outbound_rx)
                    .await
            }
            Err(e) => {
                tracing::debug!(client = %client.id(), "failed to write connect reply: {e}");
                Disconnect::CONNECTION_LOST
            }
        };
        client.close();
        drop(outbound_rx);

        session
            .on_disconnect(&client, &DisconnectEvent { disconnect })
            .await;

        metrics::counter!("relay_disconnections_total", "transport" => transport).increment(1);
        metrics::gauge!("relay_sessions_active").decrement(1.0);
        Ok(())
    }

    async fn session_loop(
        &self,
        stream: &mut dyn ServerStream,
        client: &Client,
        session: &dyn SessionHandler,
        outbound: &mut mpsc::Receiver<Bytes>,
    ) -> Disconnect {
        let mut pending = VecDeque::new();
        loop {
            if self.inner.shutdown.is_cancelled() {
                return close_for_shutdown(stream, client).await;
            }

            let frame = match pending.pop_front() {
                Some(frame) => frame,
                None => tokio::select! {
                    biased;
                    () = self.inner.shutdown.cancelled() => {
                        return close_for_shutdown(stream, client).await;
                    }
                    () = client.context().cancelled() => {
                        if client.is_slow() {
                            reject(stream, &Disconnect::SLOW).await;
                            return Disconnect::SLOW;
                        }
                        return Disconnect::NORMAL;
                    }
                    Some(frame) = outbound.recv() => {
                        if let Err(e) = stream.send_frame(frame).await {
                            tracing::debug!(client = %client.id(), "send failed: {e}");
                            return Disconnect::CONNECTION_LOST;
                        }
                        continue;
                    }
                    incoming = stream.recv_frame() => match incoming {
                        None => return Disconnect::NORMAL,
                        Some(Err(e)) => {
                            tracing::debug!(client = %client.id(), "receive failed: {e}");
                            return Disconnect::CONNECTION_LOST;
                        }
                        Some(Ok(frame)) => frame,
                    },
                },
            };

            let (result, peer_gone) = self
                .run_handler(stream, client, session, &frame, &mut pending)
                .await;
            let reply = match result {
                Ok(reply) => reply,
                Err(message) => {
                    self.raise_fatal(client, message);
                    reject(stream, &Disconnect::SERVER_ERROR).await;
                    return Disconnect::SERVER_ERROR;
                }
            };
            if let Some(disconnect) = peer_gone {
                return disconnect;
            }

            if let Err(e) = flush(stream, outbound).await {
                tracing::debug!(client = %client.id(), "send failed: {e}");
                return Disconnect::CONNECTION_LOST;
            }
            if let Some(reply) = reply {
                if let Err(e) = write_reply(stream, &reply).await {
                    tracing::debug!(client = %client.id(), "send failed: {e}");
                    return Disconnect::CONNECTION_LOST;
                }
            }
        }
    }

    /// Run the handler for one frame while keeping an eye on the connection.
    ///
    /// Frames arriving meanwhile are queued on `pending`. A peer close or
    /// the start of shutdown cancels the session context so the handler can
    /// give up early. A peer close is returned next to the handler result.
    async fn run_handler(
        &self,
        stream: &mut dyn ServerStream,
        client: &Client,
        session: &dyn SessionHandler,
        frame: &[u8],
        pending: &mut VecDeque<Bytes>,
    ) -> (Result<Option<Reply>, String>, Option<Disconnect>) {
        let dispatch = self.dispatch(client, session, frame);
        tokio::pin!(dispatch);

        let mut watching = true;
        let mut peer_gone = None;
        loop {
            let reading = watching && pending.len() < MAX_PENDING_FRAMES;
            tokio::select! {
                biased;
                result = &mut dispatch => return (result, peer_gone),
                () = self.inner.shutdown.cancelled(), if watching => {
                    client.close();
                    watching = false;
                }
                incoming = stream.recv_frame(), if reading => match incoming {
                    Some(Ok(frame)) => pending.push_back(frame),
                    None => {
                        client.close();
                        watching = false;
                        peer_gone = Some(Disconnect::NORMAL);
                    }
                    Some(Err(e)) => {
                        tracing::debug!(client = %client.id(), "receive failed: {e}");
                        client.close();
                        watching = false;
                        peer_gone = Some(Disconnect::CONNECTION_LOST);
                    }
                },
            }
        }
    }

    /// Decode one command and run the matching handler.
    ///
    /// `Err` carries the message of a fatal handler error.
    async fn dispatch(
        &self,
        client: &Client,
        session: &dyn SessionHandler,
        frame: &[u8],
    ) -> Result<Option<Reply>, String> {
        let command = match Command::decode(frame) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(client = %client.id(), "invalid command: {e}");
                return Ok(Some(ReplyError::BAD_REQUEST.into()));
            }
        };

        let result = match command {
            Command::Subscribe { channel } => {
                if channel.is_empty() {
                    return Ok(Some(ReplyError::BAD_REQUEST.into()));
                }
                let event = SubscribeEvent { channel };
                let result = session.on_subscribe(client, &event).await;
                result.map(|_| Reply::Subscribed {
                    channel: event.channel,
                })
            }
            Command::Unsubscribe { channel } => {
                if channel.is_empty() {
                    return Ok(Some(ReplyError::BAD_REQUEST.into()));
                }
                let event = UnsubscribeEvent { channel };
                session.on_unsubscribe(client, &event).await;
                Ok(Reply::Unsubscribed {
                    channel: event.channel,
                })
            }
            Command::Publish { channel, data } => {
                if channel.is_empty() {
                    return Ok(Some(ReplyError::BAD_REQUEST.into()));
                }
                if !self.inner.config.allow_publish {
                    return Ok(Some(ReplyError::PERMISSION_DENIED.into()));
                }
                let event = PublishEvent { channel, data };
                let result = session.on_publish(client, &event).await;
                result.map(|_| Reply::Published {
                    channel: event.channel,
                })
            }
            Command::Message { data } => {
                metrics::counter!("relay_messages_total").increment(1);
                return match session.on_message(client, &MessageEvent { data }).await {
                    Ok(_) => Ok(None),
                    Err(HandlerError::Reject(e)) => Ok(Some(e.into())),
                    Err(HandlerError::Fatal(message)) => Err(message),
                };
            }
            Command::Ping => Ok(Reply::Pong),
        };

        match result {
            Ok(reply) => Ok(Some(reply)),
            Err(HandlerError::Reject(e)) => Ok(Some(e.into())),
            Err(HandlerError::Fatal(message)) => Err(message),
        }
    }

    fn raise_fatal(&self, client: &Client, message: String) {
        tracing::error!(client = %client.id(), user = client.user_id(), "fatal session error: {message}");
        let error = FatalError {
            client: client.id(),
            message,
        };
        self.inner.fatal.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(error);
                true
            } else {
                false
            }
        });
    }
}

async fn write_reply(stream: &mut dyn ServerStream, reply: &Reply) -> Result<(), TransportError> {
    match reply.encode() {
        Ok(frame) => stream.send_frame(frame).await,
        Err(e) => {
            tracing::error!("Failed to serialize reply: {e}");
            Ok(())
        }
    }
}

/// Best-effort disconnect notice before the node drops a stream.
async fn reject(stream: &mut dyn ServerStream, disconnect: &Disconnect) {
    if let Err(e) = write_reply(stream, &disconnect.into()).await {
        tracing::debug!(%disconnect, "failed to notify client: {e}");
    }
}

async fn close_for_shutdown(stream: &mut dyn ServerStream, client: &Client) -> Disconnect {
    client.close();
    reject(stream, &Disconnect::SHUTDOWN).await;
    Disconnect::SHUTDOWN
}

async fn flush(
    stream: &mut dyn ServerStream,
    outbound: &mut mpsc::Receiver<Bytes>,
) -> Result<(), TransportError> {
    while let Ok(frame) = outbound.try_recv() {
        stream.send_frame(frame).await?;
    }
    Ok(())
}
