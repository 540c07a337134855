//! Registry of cluster accessors

use crate::accessor::{ClusterAccessor, DEFAULT_RETRY_INTERVAL};
use crate::error::AccessorError;
use kube::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug)]
struct Entry {
    accessor: Arc<ClusterAccessor>,
    /// Stops this accessor's initialization loop
    cancel: CancellationToken,
}

/// Owns one accessor per distinct cluster configuration.
///
/// Accessors added after [`start`](Self::start) begin initializing right away.
#[derive(Debug)]
pub struct ClusterAccessorManager {
    accessors: RwLock<Vec<Entry>>,
    retry_interval: Duration,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Default for ClusterAccessorManager {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL)
    }
}

impl ClusterAccessorManager {
    /// Creates an empty manager retrying initialization every `retry_interval`
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            accessors: RwLock::new(Vec::new()),
            retry_interval,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Registers a configuration under `key`. Adding an existing key returns
    /// the accessor registered first.
    pub fn add(&self, key: impl Into<String>, config: Config) -> Arc<ClusterAccessor> {
        let key = key.into();
        let (accessor, cancel) = {
            let mut accessors = self.accessors.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = accessors.iter().find(|e| e.accessor.key() == key) {
                return Arc::clone(&existing.accessor);
            }
            debug!("Adding cluster accessor {}", key);
            let entry = Entry {
                accessor: Arc::new(ClusterAccessor::new(key, config)),
                cancel: self.cancel.child_token(),
            };
            let handles = (Arc::clone(&entry.accessor), entry.cancel.clone());
            accessors.push(entry);
            handles
        };
        if self.started.load(Ordering::SeqCst) {
            accessor.start(self.retry_interval, cancel);
        }
        accessor
    }

    /// Unregisters the accessor under `key` and stops its initialization
    /// loop. Handles already given out keep working.
    pub fn remove(&self, key: &str) -> Option<Arc<ClusterAccessor>> {
        let mut accessors = self.accessors.write().unwrap_or_else(PoisonError::into_inner);
        let index = accessors.iter().position(|e| e.accessor.key() == key)?;
        let entry = accessors.remove(index);
        entry.cancel.cancel();
        info!("Removed cluster accessor {}", key);
        Some(entry.accessor)
    }

    /// Keys of all registered accessors starting with `prefix`
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.accessors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.accessor.key())
            .filter(|k| k.starts_with(prefix))
            .map(ToString::to_string)
            .collect()
    }

    /// Starts background initialization of all registered accessors
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let accessors: Vec<(Arc<ClusterAccessor>, CancellationToken)> = self
            .accessors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| (Arc::clone(&e.accessor), e.cancel.clone()))
            .collect();
        info!("Starting {} cluster accessor(s)", accessors.len());
        for (accessor, cancel) in accessors {
            accessor.start(self.retry_interval, cancel);
        }
    }

    /// Stops all pending initialization loops
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn snapshot(&self) -> Vec<Arc<ClusterAccessor>> {
        self.accessors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| Arc::clone(&e.accessor))
            .collect()
    }

    /// Accessor registered under `key`
    pub fn get(&self, key: &str) -> Option<Arc<ClusterAccessor>> {
        self.snapshot().into_iter().find(|a| a.key() == key)
    }

    /// Like [`get`](Self::get), failing with [`AccessorError::NotFound`]
    pub fn require(&self, key: &str) -> Result<Arc<ClusterAccessor>, AccessorError> {
        self.get(key).ok_or_else(|| AccessorError::NotFound(key.to_string()))
    }

    /// First initialized accessor pointing at the cluster with `cluster_id`.
    ///
    /// Several configurations may reach the same physical cluster; they all
    /// resolve to the accessor registered first.
    pub fn get_for_cluster_id(&self, cluster_id: &str) -> Option<Arc<ClusterAccessor>> {
        self.snapshot()
            .into_iter()
            .find(|a| a.cluster_id().as_deref() == Some(cluster_id))
    }

    /// Number of registered accessors
    pub fn len(&self) -> usize {
        self.accessors.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ClusterAccessorManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
