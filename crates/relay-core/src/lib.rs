//! Core abstractions for relay sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `Credentials` - Identity of a connecting client
//! - `ProcessingContext` - Cancellable carrier of request-scoped values
//! - `set_credentials` - Context decoration shared by all transports
//! - `WrappedStream` - Context-rewriting wrapper over a client stream
//! - Identity resolution and stream traits

pub mod context;
pub mod identity;
pub mod traits;
pub mod wrapper;

pub use context::{Credentials, ProcessingContext, set_credentials};
pub use identity::{AuthError, ConnectAttempt, HeaderIdentity, IdentityResolver, StaticIdentity};
pub use traits::{Encoding, ServerStream, TransportError};
pub use wrapper::WrappedStream;
