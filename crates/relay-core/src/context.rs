//! Request-scoped processing context and connecting-principal credentials.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

/// Identity of a connecting principal.
///
/// Immutable once constructed. An empty user ID denotes an anonymous client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    user_id: String,
}

impl Credentials {
    /// Create credentials for the given user.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    /// Credentials for an anonymous client.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self {
            user_id: String::new(),
        }
    }

    /// The resolved user ID (empty when anonymous).
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_empty()
    }
}

/// Cancellable carrier of request-scoped values.
///
/// Cloning is cheap. A context is never mutated in place: decoration
/// produces a new value, so every clone taken after decoration observes
/// the same credentials for its whole lifetime.
#[derive(Debug, Clone, Default)]
pub struct ProcessingContext {
    cancel: CancellationToken,
    credentials: Option<Arc<Credentials>>,
}

impl ProcessingContext {
    /// Create an empty, uncancelled context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials attached by a transport adapter, if any.
    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_deref()
    }

    /// Shorthand for the attached user ID.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.credentials().map(Credentials::user_id)
    }

    /// Whether both contexts share the very same credentials value.
    #[must_use]
    pub fn shares_credentials_with(&self, other: &Self) -> bool {
        match (&self.credentials, &other.credentials) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is canceled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Derive a child context bound to the returned guard.
    ///
    /// The child keeps the parent's credentials and is canceled when the
    /// guard is dropped or when the parent is canceled. Transports hold the
    /// guard for as long as the underlying connection is open.
    #[must_use]
    pub fn scoped(&self) -> (Self, DropGuard) {
        let (child, cancel) = self.child();
        (child, cancel.drop_guard())
    }

    /// Derive a child context together with the token that cancels it.
    ///
    /// Canceling the parent cancels the child, never the other way round.
    #[must_use]
    pub fn child(&self) -> (Self, CancellationToken) {
        let cancel = self.cancel.child_token();
        (
            Self {
                cancel: cancel.clone(),
                credentials: self.credentials.clone(),
            },
            cancel,
        )
    }
}

/// Attach credentials to a context.
///
/// Pure: the input context is left untouched and the returned context shares
/// its cancellation with it.
#[must_use]
pub fn set_credentials(ctx: &ProcessingContext, credentials: Credentials) -> ProcessingContext {
    ProcessingContext {
        cancel: ctx.cancel.clone(),
        credentials: Some(Arc::new(credentials)),
    }
}
