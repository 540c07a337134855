//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the result store,
//! the cluster accessors, the pipeline and the reconciler together and runs
//! the KluctlDeployment watcher.

use crate::config::Config;
use crate::error::ControllerError;
use crate::pipeline::{DeploymentPipeline, ProcessPipeline};
use crate::reconciler::cycle::DeploymentRunner;
use crate::reconciler::target::IN_CLUSTER;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use cluster_accessor::ClusterAccessorManager;
use crds::KluctlDeployment;
use kube::{Api, Client};
use results::{ResultStore, SecretResultStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for KluctlDeployment management.
pub struct Controller {
    kluctl_deployment_watcher: JoinHandle<Result<(), ControllerError>>,
    accessors: Arc<ClusterAccessorManager>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing KluctlDeployment Controller");

        // Create Kubernetes client
        let kube_config = kube::Config::infer()
            .await
            .map_err(|e| ControllerError::InvalidConfig(format!("failed to load Kubernetes config: {}", e)))?;
        let kube_client = Client::try_from(kube_config.clone())?;

        let store: Arc<dyn ResultStore> = Arc::new(SecretResultStore::new(
            kube_client.clone(),
            config.results_namespace.clone(),
            config.retention,
        ));

        // The controller's own cluster is always available as a target
        let accessors = Arc::new(ClusterAccessorManager::new(config.cluster_retry_interval));
        accessors.add(IN_CLUSTER, kube_config);
        accessors.start();

        let pipeline: Arc<dyn DeploymentPipeline> = Arc::new(ProcessPipeline::new(config.pipeline_command.clone()));
        let runner = DeploymentRunner::new(store, pipeline);
        let reconciler = Arc::new(Reconciler::new(kube_client.clone(), accessors.clone(), runner));

        let api: Api<KluctlDeployment> = match config.watch_namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client, ns),
            None => Api::all(kube_client),
        };
        let watcher_instance = Watcher::new(reconciler, api, config.concurrency);

        // Start watcher in background task
        let kluctl_deployment_watcher =
            tokio::spawn(async move { watcher_instance.watch_kluctl_deployments().await });

        Ok(Self {
            kluctl_deployment_watcher,
            accessors,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("KluctlDeployment Controller running");

        // Wait for the watcher to exit (it should run forever) or a shutdown signal
        let result = tokio::select! {
            result = &mut self.kluctl_deployment_watcher => {
                result
                    .map_err(|e| ControllerError::Watch(format!("KluctlDeployment watcher panicked: {}", e)))
                    .and_then(|r| r.map_err(|e| ControllerError::Watch(format!("KluctlDeployment watcher error: {}", e))))
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                Ok(())
            }
        };

        self.accessors.shutdown();
        result
    }
}
