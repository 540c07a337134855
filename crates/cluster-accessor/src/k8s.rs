//! Cluster handle for dynamic object access

use crate::error::AccessorError;
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use results::ObjectRef;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of deleting one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// The object existed and deletion was accepted
    Deleted,
    /// The object (or its whole kind) is no longer present
    AlreadyGone,
}

/// Outcome of a batch deletion
#[derive(Debug, Default)]
pub struct DeletionReport {
    pub deleted: Vec<ObjectRef>,
    pub already_gone: Vec<ObjectRef>,
    pub failed: Vec<(ObjectRef, String)>,
}

impl DeletionReport {
    /// True when no object failed to delete
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Client plus discovery of one cluster, possibly impersonated
#[derive(Clone)]
pub struct K8sCluster {
    client: Client,
    discovery: Arc<Discovery>,
    cluster_id: String,
}

impl std::fmt::Debug for K8sCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("K8sCluster")
            .field("cluster_id", &self.cluster_id)
            .finish_non_exhaustive()
    }
}

impl K8sCluster {
    pub(crate) fn new(client: Client, discovery: Arc<Discovery>, cluster_id: String) -> Self {
        Self {
            client,
            discovery,
            cluster_id,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn dynamic_api(&self, discovery: &Discovery, object: &ObjectRef) -> Option<Api<DynamicObject>> {
        let gvk = GroupVersionKind::gvk(&object.group, &object.version, &object.kind);
        let (resource, caps) = discovery.resolve_gvk(&gvk)?;
        Some(match caps.scope {
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), &object.namespace, &resource),
        })
    }

    /// Runs API discovery again with this handle's client
    pub async fn discover(&self) -> Result<Discovery, AccessorError> {
        Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| AccessorError::Discovery(e.to_string()))
    }

    /// Deletes one object. Objects that do not exist count as gone, so the
    /// call can be repeated after a partial failure.
    ///
    /// A kind missing from the accessor's discovery snapshot may have been
    /// registered since; it only counts as gone once a fresh discovery run
    /// confirms it is not served.
    pub async fn delete_object(&self, object: &ObjectRef) -> Result<DeletionOutcome, AccessorError> {
        self.delete_with(object, &mut None).await
    }

    async fn delete_with(
        &self,
        object: &ObjectRef,
        fresh: &mut Option<Arc<Discovery>>,
    ) -> Result<DeletionOutcome, AccessorError> {
        let api = match self.dynamic_api(&self.discovery, object) {
            Some(api) => Some(api),
            None => {
                if fresh.is_none() {
                    debug!("Kind of {} not in discovery snapshot, refreshing", object);
                    *fresh = Some(Arc::new(self.discover().await?));
                }
                fresh.as_deref().and_then(|d| self.dynamic_api(d, object))
            }
        };
        let Some(api) = api else {
            debug!("Kind of {} is not served anymore, treating as gone", object);
            return Ok(DeletionOutcome::AlreadyGone);
        };
        match api.delete(&object.name, &DeleteParams::background()).await {
            Ok(_) => Ok(DeletionOutcome::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeletionOutcome::AlreadyGone),
            Err(e) => Err(AccessorError::Kube(e)),
        }
    }

    /// Deletes all objects, continuing past individual failures
    pub async fn delete_objects(&self, objects: &[ObjectRef]) -> DeletionReport {
        let mut report = DeletionReport::default();
        // one refresh per batch
        let mut fresh = None;
        for object in objects {
            match self.delete_with(object, &mut fresh).await {
                Ok(DeletionOutcome::Deleted) => {
                    info!("Deleted {}", object);
                    report.deleted.push(object.clone());
                }
                Ok(DeletionOutcome::AlreadyGone) => {
                    debug!("{} already gone", object);
                    report.already_gone.push(object.clone());
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", object, e);
                    report.failed.push((object.clone(), e.to_string()));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_cluster() -> K8sCluster {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        K8sCluster::new(client.clone(), Arc::new(Discovery::new(client)), "uid-1".to_string())
    }

    #[tokio::test]
    async fn test_unknown_kind_needs_fresh_discovery() {
        // the snapshot knows no kinds and the cluster cannot be reached, so
        // nothing may be reported as gone
        let k = offline_cluster();
        let cm = ObjectRef::new("", "v1", "ConfigMap", "default", "cm1");
        assert!(matches!(k.delete_object(&cm).await, Err(AccessorError::Discovery(_))));

        let report = k.delete_objects(&[cm.clone(), cm]).await;
        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 2);
        assert!(report.already_gone.is_empty());
        assert!(report.deleted.is_empty());
    }
}
