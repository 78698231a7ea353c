//! Handle to one connected client.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use relay_core::{Credentials, Encoding, ProcessingContext};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Client identifier.
pub type ClientId = Uuid;

/// Error sending to a client.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection already closed.
    #[error("Client connection closed")]
    Closed,
    /// The outbox is full. The session is being closed as slow.
    #[error("Client outbox full ({capacity} frames)")]
    Full { capacity: usize },
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

impl SendError {
    /// Whether the failure is the expected close race.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the session is already on its way out, either closed or
    /// being dropped as slow.
    #[must_use]
    pub const fn is_session_ending(&self) -> bool {
        matches!(self, Self::Closed | Self::Full { .. })
    }
}

/// Sending half of a session outbox.
pub(crate) struct Outbox {
    pub(crate) sender: mpsc::Sender<Bytes>,
    pub(crate) capacity: usize,
    pub(crate) max_frame_size: usize,
}

struct Inner {
    id: ClientId,
    credentials: Credentials,
    transport: &'static str,
    encoding: Encoding,
    context: ProcessingContext,
    cancel: CancellationToken,
    outbox: Outbox,
    slow: AtomicBool,
}

/// One connected client, cheap to clone.
///
/// Owned by the node for the lifetime of the transport connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// `cancel` must cancel `context`; it ends the session.
    pub(crate) fn new(
        credentials: Credentials,
        transport: &'static str,
        encoding: Encoding,
        context: ProcessingContext,
        cancel: CancellationToken,
        outbox: Outbox,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                credentials,
                transport,
                encoding,
                context,
                cancel,
                outbox,
                slow: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        self.inner.credentials.user_id()
    }

    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    #[must_use]
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport
    }

    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.inner.encoding
    }

    /// The session context. It carries the admitted credentials and is
    /// canceled as soon as the connection closes or the node shuts down.
    #[must_use]
    pub fn context(&self) -> &ProcessingContext {
        &self.inner.context
    }

    /// Push raw data to the client as its own frame.
    ///
    /// Never waits. A full outbox marks the client slow and ends its
    /// session.
    ///
    /// # Errors
    /// Returns [`SendError::Closed`] once the connection has gone away and
    /// [`SendError::Full`] when the outbox is full.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), SendError> {
        let data = data.into();
        let outbox = &self.inner.outbox;
        if data.len() > outbox.max_frame_size {
            return Err(SendError::FrameTooLarge {
                size: data.len(),
                max: outbox.max_frame_size,
            });
        }
        match outbox.sender.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
            Err(TrySendError::Full(_)) => {
                if !self.inner.slow.swap(true, Ordering::SeqCst) {
                    tracing::warn!(client = %self.inner.id, capacity = outbox.capacity, "client outbox full");
                }
                self.inner.cancel.cancel();
                Err(SendError::Full {
                    capacity: outbox.capacity,
                })
            }
        }
    }

    pub(crate) fn is_slow(&self) -> bool {
        self.inner.slow.load(Ordering::SeqCst)
    }

    /// End the session. Its context is canceled.
    pub(crate) fn close(&self) {
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("user", &self.inner.credentials.user_id())
            .field("transport", &self.inner.transport)
            .finish_non_exhaustive()
    }
}
