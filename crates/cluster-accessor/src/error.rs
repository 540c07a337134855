//! Cluster accessor errors

use thiserror::Error;

/// Errors returned by cluster accessors
#[derive(Debug, Error)]
pub enum AccessorError {
    /// Background initialization has not completed yet; retry later
    #[error("cluster accessor {0} is not initialized yet")]
    NotReady(String),

    /// No accessor is registered for the given key or cluster id
    #[error("no cluster accessor for {0}")]
    NotFound(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Client configuration could not be built
    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),

    /// API discovery or cluster identity probe failed
    #[error("discovery failed: {0}")]
    Discovery(String),
}

impl AccessorError {
    /// True for errors that go away by waiting
    pub fn is_retryable(&self) -> bool {
        matches!(self, AccessorError::NotReady(_) | AccessorError::Kube(_) | AccessorError::Discovery(_))
    }
}
