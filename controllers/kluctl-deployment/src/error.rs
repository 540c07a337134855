//! Controller-specific error types.
//!
//! Errors are split into input errors, which stay until the resource changes,
//! and transient errors, which are retried at the retry interval.

use cluster_accessor::AccessorError;
use crds::InvalidSpec;
use kube::Error as KubeError;
use results::ResultStoreError;
use thiserror::Error;

/// Errors that can occur in the KluctlDeployment controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Result store error
    #[error("result store error: {0}")]
    ResultStore(#[from] ResultStoreError),

    /// Target cluster not reachable or not initialized yet
    #[error("cluster accessor error: {0}")]
    Accessor(#[from] AccessorError),

    /// Spec the controller can never act on
    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] InvalidSpec),

    /// Status could not be serialized for patching
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Finalizer handling failed
    #[error("finalizer error: {0}")]
    Finalizer(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Input errors are not retried on a timer; they wait for the resource
    /// to change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerError::InvalidSpec(_) | ControllerError::InvalidConfig(_)
        )
    }
}

impl From<kube_runtime::finalizer::Error<ControllerError>> for ControllerError {
    fn from(e: kube_runtime::finalizer::Error<ControllerError>) -> Self {
        use kube_runtime::finalizer::Error;
        match e {
            Error::ApplyFailed(inner) | Error::CleanupFailed(inner) => inner,
            Error::AddFinalizer(e) | Error::RemoveFinalizer(e) => ControllerError::Kube(e),
            other => ControllerError::Finalizer(other.to_string()),
        }
    }
}
