//! Per-cluster accessor
//!
//! An accessor owns the base configuration of one cluster. Discovery and the
//! cluster identity are filled in by a background task that retries until the
//! cluster answers. Clients are always built from a copy of the base
//! configuration, so impersonation never leaks between callers.

use crate::error::AccessorError;
use crate::k8s::K8sCluster;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, ServiceAccount};
use kube::discovery::Discovery;
use kube::{Api, Client, Config};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Namespace whose UID identifies a cluster
pub const CLUSTER_ID_NAMESPACE: &str = "kube-system";

/// Default delay between initialization attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct Initialized {
    discovery: Arc<Discovery>,
    cluster_id: String,
}

/// Lazily initialized access to one cluster
pub struct ClusterAccessor {
    key: String,
    config: Config,
    state: Mutex<Option<Initialized>>,
    started: AtomicBool,
}

impl std::fmt::Debug for ClusterAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAccessor")
            .field("key", &self.key)
            .field("cluster_url", &self.config.cluster_url)
            .field("cluster_id", &self.cluster_id())
            .finish_non_exhaustive()
    }
}

impl ClusterAccessor {
    /// Creates an uninitialized accessor
    pub fn new(key: impl Into<String>, config: Config) -> Self {
        Self {
            key: key.into(),
            config,
            state: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Key the accessor was registered under
    pub fn key(&self) -> &str {
        &self.key
    }

    fn state(&self) -> Option<Initialized> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn initialized(&self) -> Result<Initialized, AccessorError> {
        self.state().ok_or_else(|| AccessorError::NotReady(self.key.clone()))
    }

    /// True once discovery ran and the cluster id is known
    pub fn is_initialized(&self) -> bool {
        self.state().is_some()
    }

    /// Synthetic cluster identity (UID of `kube-system`), once initialized
    pub fn cluster_id(&self) -> Option<String> {
        self.state().map(|s| s.cluster_id)
    }

    /// Spawns the initialization loop, once. Later calls return `None`.
    pub fn start(self: &Arc<Self>, retry_interval: Duration, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let accessor = Arc::clone(self);
        Some(tokio::spawn(async move {
            accessor.init_loop(retry_interval, cancel).await;
        }))
    }

    async fn init_loop(&self, retry_interval: Duration, cancel: CancellationToken) {
        loop {
            let attempt = tokio::select! {
                () = cancel.cancelled() => return,
                res = self.try_init() => res,
            };
            match attempt {
                Ok(()) => return,
                Err(e) => {
                    warn!("Cluster accessor {} not ready, retrying in {:?}: {}", self.key, retry_interval, e);
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(retry_interval) => {}
            }
        }
    }

    /// One initialization attempt: API discovery plus the cluster identity probe
    pub async fn try_init(&self) -> Result<(), AccessorError> {
        let client = Client::try_from(self.config.clone())?;

        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(|e| AccessorError::Discovery(e.to_string()))?;

        let namespaces: Api<Namespace> = Api::all(client);
        let ns = namespaces.get(CLUSTER_ID_NAMESPACE).await?;
        let cluster_id = ns
            .metadata
            .uid
            .ok_or_else(|| AccessorError::Discovery(format!("namespace {} has no uid", CLUSTER_ID_NAMESPACE)))?;

        info!("Cluster accessor {} initialized (cluster id {})", self.key, cluster_id);
        self.set_initialized(Arc::new(discovery), cluster_id);
        Ok(())
    }

    pub(crate) fn set_initialized(&self, discovery: Arc<Discovery>, cluster_id: String) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(Initialized { discovery, cluster_id });
    }

    /// Copy of the base configuration with impersonation applied.
    ///
    /// An empty user and no groups means no impersonation.
    pub fn impersonated_config(&self, as_user: Option<&str>, as_groups: &[String]) -> Config {
        let mut config = self.config.clone();
        config.auth_info.impersonate = as_user.filter(|u| !u.is_empty()).map(ToString::to_string);
        config.auth_info.impersonate_groups = if as_groups.is_empty() {
            None
        } else {
            Some(as_groups.to_vec())
        };
        config
    }

    /// Generic client, optionally impersonating a user and groups
    pub fn client(&self, as_user: Option<&str>, as_groups: &[String]) -> Result<Client, AccessorError> {
        self.initialized()?;
        debug!("Building client for {} (as user {:?})", self.key, as_user);
        Ok(Client::try_from(self.impersonated_config(as_user, as_groups))?)
    }

    /// Client limited to core/v1 resources
    pub fn core_v1_client(&self, as_user: Option<&str>, as_groups: &[String]) -> Result<CoreV1Client, AccessorError> {
        Ok(CoreV1Client {
            client: self.client(as_user, as_groups)?,
        })
    }

    /// Cluster handle with client and discovery, for dynamic object access
    pub fn get_k(&self, as_user: Option<&str>, as_groups: &[String]) -> Result<K8sCluster, AccessorError> {
        let state = self.initialized()?;
        let client = Client::try_from(self.impersonated_config(as_user, as_groups))?;
        Ok(K8sCluster::new(client, state.discovery, state.cluster_id))
    }
}

/// Typed access to the core/v1 API group only
#[derive(Clone)]
pub struct CoreV1Client {
    client: Client,
}

impl std::fmt::Debug for CoreV1Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreV1Client").finish_non_exhaustive()
    }
}

impl CoreV1Client {
    pub fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    pub fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn service_accounts(&self, namespace: &str) -> Api<ServiceAccount> {
        Api::namespaced(self.client.clone(), namespace)
    }
}
