//! Error taxonomy for the notification pipeline.
//!
//! Hard failures (security violations, bad arguments on synchronous calls)
//! surface as `Err`. Policy rejections on the one-way enqueue path are *not*
//! errors: the caller has no return channel, so those are logged, counted in
//! usage stats, and swallowed.

use thiserror::Error;

use crate::types::NotificationKey;

#[derive(Debug, Error)]
pub enum NotificationError {
    /// Caller attempted something its identity does not permit (instant app
    /// creating notifications, listener without a companion association,
    /// cross-user post from a non-system uid).
    #[error("security violation: {0}")]
    Security(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no notification found for key {0}")]
    NotFound(NotificationKey),

    #[error("service {0} is not registered")]
    ServiceNotRegistered(String),

    /// The worker queues are gone; the pipeline was shut down.
    #[error("pipeline is shut down")]
    ShutDown,

    #[error("policy persistence failed: {0}")]
    Persistence(#[from] herald_core::CoreError),

    #[error("internal error: {0}")]
    Internal(String),
}
