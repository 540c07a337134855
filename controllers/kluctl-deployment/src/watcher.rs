//! Kubernetes resource watcher.
//!
//! Watches KluctlDeployment resources and drives reconciliation through
//! `kube_runtime::Controller`, which handles reconnection, requeues and
//! per-object serialization. The finalizer wraps every reconcile so deleted
//! resources get their cleanup before they disappear.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::{KluctlDeployment, KLUCTL_DEPLOYMENT_FINALIZER};
use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::controller::Config as ControllerConfig;
use kube_runtime::finalizer::{finalizer, Event};
use kube_runtime::{watcher, Controller};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Watches KluctlDeployment resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    api: Api<KluctlDeployment>,
    concurrency: u16,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(reconciler: Arc<Reconciler>, api: Api<KluctlDeployment>, concurrency: u16) -> Self {
        Self {
            reconciler,
            api,
            concurrency,
        }
    }

    /// Starts watching KluctlDeployment resources. Runs until the watch
    /// stream ends.
    pub async fn watch_kluctl_deployments(&self) -> Result<(), ControllerError> {
        info!("Starting KluctlDeployment watcher");

        let error_policy = |obj: Arc<KluctlDeployment>, error: &ControllerError, ctx: Arc<Reconciler>| {
            error!("Reconciliation error for KluctlDeployment {}: {}", obj.key(), error);
            ctx.error_policy(&obj, error)
        };

        let reconcile = |obj: Arc<KluctlDeployment>, ctx: Arc<Reconciler>| async move {
            debug!("Reconciling KluctlDeployment {}", obj.key());
            let api: Api<KluctlDeployment> =
                Api::namespaced(ctx.client().clone(), &obj.namespace().unwrap_or_default());
            finalizer(&api, KLUCTL_DEPLOYMENT_FINALIZER, obj, |event| async {
                match event {
                    Event::Apply(obj) => ctx.reconcile(&obj).await,
                    Event::Cleanup(obj) => ctx.cleanup(&obj).await,
                }
            })
            .await
            .map_err(ControllerError::from)
        };

        // Short debounce: status patches of a cycle arrive in bursts
        let controller_config = ControllerConfig::default()
            .debounce(Duration::from_secs(1))
            .concurrency(self.concurrency);

        Controller::new(self.api.clone(), watcher::Config::default())
            .with_config(controller_config)
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled KluctlDeployment {}", obj.name),
                    Err(e) => error!("Controller error for KluctlDeployment: {}", e),
                }
            })
            .await;

        Ok(())
    }
}

