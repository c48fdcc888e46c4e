//! Error types for signal trees.
//!
//! Command rejection is not an error here. A rejected command is a normal
//! outcome reported as [`CommandResult::Reject`](crate::CommandResult) and
//! surfaced to callers through [`ResultOrError::Error`](crate::ResultOrError).
//! `SignalError` covers misuse of the commit protocol and infrastructure
//! failures around it.

use thiserror::Error;

/// Errors raised by signal trees and operation handles.
#[derive(Debug, Error)]
pub enum SignalError {
    /// The tree does not support the requested step of the commit protocol.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// `apply_changes` or `publish_changes` called on a commit whose
    /// `can_commit()` returned false.
    #[error("pending commit cannot be committed; call mark_as_aborted instead")]
    NotCommittable,

    /// An operation handle was resolved a second time.
    #[error("operation has already been resolved")]
    AlreadyResolved,

    /// The tree refused a local commit because too many commands are
    /// still waiting for confirmation.
    #[error("{pending} commands are waiting for confirmation (limit {limit})")]
    PendingLimitExceeded { pending: usize, limit: usize },

    /// A tree image cannot be restored, for example because its confirmed
    /// snapshot has no root node.
    #[error("invalid tree image: {0}")]
    InvalidImage(&'static str),

    /// A local tree was created outside of a tokio runtime.
    #[error("no tokio runtime available to run the confirmation worker")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// A signal value could not be converted to or from JSON.
    #[error("value conversion failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = SignalError> = std::result::Result<T, E>;
