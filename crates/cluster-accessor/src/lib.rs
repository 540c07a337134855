//! Cluster Accessor
//!
//! Kubernetes clients for the clusters deployments target. Every distinct
//! cluster configuration gets one [`ClusterAccessor`], registered with the
//! [`ClusterAccessorManager`]. Accessors initialize in the background and
//! retry every few seconds until the cluster answers; until then every client
//! request fails with the retryable [`AccessorError::NotReady`].
//!
//! Once initialized, an accessor knows its cluster id, the UID of the
//! `kube-system` namespace. Different configurations reaching the same
//! physical cluster share that id.

pub mod accessor;
pub mod error;
pub mod k8s;
pub mod manager;

pub use accessor::{ClusterAccessor, CoreV1Client, CLUSTER_ID_NAMESPACE, DEFAULT_RETRY_INTERVAL};
pub use error::AccessorError;
pub use k8s::{DeletionOutcome, DeletionReport, K8sCluster};
pub use manager::ClusterAccessorManager;
