//! Error type for the kube subnet manager.
//!
//! Callers are expected to retry [`SubnetError::NotAssigned`] later, treat
//! [`SubnetError::Unsupported`] as permanent and see directory failures
//! as they came from the service.

use std::time::Duration;

use thiserror::Error;

use crate::directory::DirectoryError;

/// Errors returned by [`KubeSubnetManager`].
///
/// [`KubeSubnetManager`]: crate::manager::KubeSubnetManager
#[derive(Debug, Error)]
pub enum SubnetError {
    /// the allocator has not assigned an address block to the node yet
    #[error("node {0:?} pod cidr not assigned")]
    NotAssigned(String),

    /// the node carries an address block that is not an IPv4 CIDR
    #[error("node {node:?} has invalid pod cidr {cidr:?}")]
    InvalidCidr { node: String, cidr: String },

    /// operation is not implemented by this manager
    #[error("unimplemented: {0}")]
    Unsupported(&'static str),

    /// lookup or patch failure, passed through unchanged
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// node cache did not finish its initial sync in time
    #[error("error waiting for node cache to sync state after {0:?}")]
    SyncTimeout(Duration),

    /// every retry hit a conflicting write, `source` is the last conflict
    #[error("max retries exhausted after {attempts} conflicting patches")]
    MaxRetriesExhausted {
        attempts: u32,
        #[source]
        source: DirectoryError,
    },
}

impl SubnetError {
    /// true for conditions that may clear up when polled again
    pub fn is_retryable(&self) -> bool {
        match self {
            SubnetError::NotAssigned(_) => true,
            SubnetError::Directory(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// true for operations this manager will never support
    pub fn is_unsupported(&self) -> bool {
        matches!(self, SubnetError::Unsupported(_))
    }

    /// true when a write lost against a concurrent one
    pub fn is_conflict(&self) -> bool {
        matches!(self, SubnetError::Directory(err) if err.is_conflict())
    }
}
