//! Contract with the directory service holding the node records.
//!
//! The cache side is an eventually consistent local mirror fed by
//! list+watch. It delivers [`Notification`]s strictly one at a time, in
//! order. The client side writes conditional annotation patches.
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::entry::{Entry, EntryPatch, Notification};

/// Errors surfaced by a directory implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// no entry with that name in the cache or the service
    #[error("node {0:?} not found")]
    NotFound(String),

    /// the entry changed since the snapshot a patch was computed from
    #[error("conflict updating node {name:?}: {message}")]
    Conflict {
        /// node name
        name: String,
        /// detail from the service
        message: String,
    },

    /// connection or API failure
    #[error("transport error: {0}")]
    Transport(String),

    /// payload could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),
}

impl DirectoryError {
    /// transient failures that may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DirectoryError::Transport(_) | DirectoryError::Conflict { .. }
        )
    }

    /// the patch precondition failed
    pub fn is_conflict(&self) -> bool {
        matches!(self, DirectoryError::Conflict { .. })
    }

    /// the entry does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::NotFound(_))
    }
}

/// Receives the serial change feed of a [`DirectoryCache`].
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    /// Called once per change. The cache never calls this concurrently and
    /// waits for it to return before delivering the next notification.
    async fn handle(&self, notification: Notification);
}

/// Local mirror of the directory.
#[async_trait]
pub trait DirectoryCache: Send + Sync + 'static {
    /// point lookup in the local mirror
    fn get(&self, name: &str) -> Result<Entry, DirectoryError>;

    /// true once the initial list has been delivered
    fn has_synced(&self) -> bool;

    /// Run the change delivery loop until `token` is cancelled, handing
    /// every change to `handler`.
    async fn run(
        &self,
        handler: Arc<dyn NotificationHandler>,
        token: CancellationToken,
    ) -> Result<(), DirectoryError>;
}

/// Write side of the directory.
#[async_trait]
pub trait DirectoryClient: Send + Sync + 'static {
    /// Apply `patch` to the entry `name`. Implementations reject the patch
    /// with [`DirectoryError::Conflict`] when the stored version no longer
    /// matches `patch.resource_version`.
    async fn patch(&self, name: &str, patch: &EntryPatch) -> Result<(), DirectoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = DirectoryError::NotFound("node-1".into());
        assert!(!not_found.is_retryable());
        assert!(not_found.is_not_found());

        let conflict = DirectoryError::Conflict {
            name: "node-1".into(),
            message: "object has been modified".into(),
        };
        assert!(conflict.is_retryable());
        assert!(conflict.is_conflict());

        let transport = DirectoryError::Transport("connection reset".into());
        assert!(transport.is_retryable());
        assert!(!transport.is_conflict());

        assert!(!DirectoryError::Codec("bad json".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let msg = DirectoryError::NotFound("node-1".into()).to_string();
        assert_eq!(msg, r#"node "node-1" not found"#);
    }
}
