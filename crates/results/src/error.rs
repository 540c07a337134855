//! Result store errors

use thiserror::Error;

/// Errors that can occur when reading or writing results
#[derive(Debug, Error)]
pub enum ResultStoreError {
    /// Kubernetes API error (Secret-backed store)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Result not found
    #[error("Result not found: {0}")]
    NotFound(String),

    /// Stored data is unusable (missing keys, foreign objects, ...)
    #[error("Invalid result data: {0}")]
    Invalid(String),

    /// Repository URL could not be turned into a key
    #[error("Invalid repository url: {0}")]
    InvalidUrl(String),

    /// Watch stream could not be established or broke down
    #[error("Watch failed: {0}")]
    Watch(String),
}
