//! Reconciliation logic for KluctlDeployment resources.
//!
//! - `plan`: pure decisions (is a cycle due, does it deploy, next requeue)
//! - `cycle`: one render/deploy/validate/drift cycle against the pipeline
//! - `target`: target cluster resolution through the accessor manager
//! - `deletion`: deleting deployed objects when the resource goes away

pub mod cycle;
pub mod deletion;
pub mod plan;
pub mod target;

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::reconcile_helpers::merge_patch_diff;
use chrono::Utc;
use cluster_accessor::ClusterAccessorManager;
use crds::{reasons, set_condition, Condition, ConditionStatus, KluctlDeployment, KluctlDeploymentStatus};
use cycle::{CycleInput, DeploymentRunner};
use deletion::{delete_deployed_objects, DeletionTarget};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::Action;
use results::KluctlDeploymentInfo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use target::resolve_target;
use tracing::{debug, info, warn};

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(5, 300), // 5 seconds min, 5 minutes max
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Reconciles KluctlDeployment resources.
pub struct Reconciler {
    client: Client,
    accessors: Arc<ClusterAccessorManager>,
    runner: DeploymentRunner,
    /// Error count tracking per resource (namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(client: Client, accessors: Arc<ClusterAccessorManager>, runner: DeploymentRunner) -> Self {
        Self {
            client,
            accessors,
            runner,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, obj: &KluctlDeployment) -> Api<KluctlDeployment> {
        Api::namespaced(self.client.clone(), &obj.namespace().unwrap_or_default())
    }

    /// Patches the difference between the stored and the new status.
    /// Nothing is sent when they are equal.
    async fn patch_status(&self, obj: &KluctlDeployment, status: &KluctlDeploymentStatus) -> Result<(), ControllerError> {
        let old = serde_json::to_value(obj.status.clone().unwrap_or_default())?;
        let new = serde_json::to_value(status)?;
        let Some(diff) = merge_patch_diff(&old, &new) else {
            debug!("Status of {} unchanged, skipping patch", obj.key());
            return Ok(());
        };

        let patch = serde_json::json!({ "status": diff });
        self.api(obj)
            .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Sets the Ready condition and patches the status
    async fn update_ready(
        &self,
        obj: &KluctlDeployment,
        status: ConditionStatus,
        reason: &str,
        message: impl AsRef<str>,
    ) -> Result<(), ControllerError> {
        let mut new_status = obj.status.clone().unwrap_or_default();
        set_condition(
            &mut new_status.conditions,
            Condition::ready(status, reason, message, obj.metadata.generation, Utc::now()),
        );
        self.patch_status(obj, &new_status).await
    }

    /// Reconciles a KluctlDeployment.
    ///
    /// This method:
    /// 1. Validates the spec and honors `suspend`
    /// 2. Resolves the target cluster
    /// 3. Runs a cycle when one is due
    /// 4. Patches the resulting status and schedules the next cycle
    pub async fn reconcile(&self, obj: &KluctlDeployment) -> Result<Action, ControllerError> {
        let key = obj.key();

        if let Err(e) = obj.spec.validate_spec() {
            warn!("KluctlDeployment {} has an invalid spec: {}", key, e);
            self.update_ready(obj, ConditionStatus::False, reasons::INVALID_SPEC, e.to_string())
                .await?;
            return Ok(Action::await_change());
        }

        if obj.spec.suspend {
            debug!("KluctlDeployment {} is suspended", key);
            self.update_ready(obj, ConditionStatus::Unknown, reasons::SUSPENDED, "deployment is suspended")
                .await?;
            return Ok(Action::await_change());
        }

        let retry_interval = obj.spec.retry_interval()?;
        let target = match resolve_target(&self.accessors, obj).await {
            Ok(target) => target,
            Err(e) => {
                warn!("Target cluster of {} not available: {}", key, e);
                self.update_ready(obj, ConditionStatus::False, reasons::DEPENDENCY_NOT_READY, e.to_string())
                    .await?;
                return Ok(Action::requeue(retry_interval));
            }
        };
        let Some(cluster_id) = target.accessor.cluster_id() else {
            let message = format!("cluster accessor {} is not initialized yet", target.accessor.key());
            info!("{} for {}", message, key);
            self.update_ready(obj, ConditionStatus::False, reasons::DEPENDENCY_NOT_READY, message)
                .await?;
            return Ok(Action::requeue(retry_interval));
        };

        let result = self
            .runner
            .run_cycle(CycleInput {
                obj,
                cluster: target.accessor.key().to_string(),
                cluster_id: Some(cluster_id),
                impersonate: target.impersonate,
                now: Utc::now(),
            })
            .await?;

        self.patch_status(obj, &result.status).await?;
        self.reset_error(&key);
        debug!("Next cycle of {} in {:?}", key, result.requeue_after);
        Ok(Action::requeue(result.requeue_after))
    }

    /// Runs when the resource is being deleted, before the finalizer is
    /// removed.
    ///
    /// Deployed objects are only deleted with `delete: true` on a resource
    /// that is not suspended. A partial deletion keeps the finalizer so the
    /// cleanup is retried.
    pub async fn cleanup(&self, obj: &KluctlDeployment) -> Result<Action, ControllerError> {
        let key = obj.key();
        if !obj.spec.delete || obj.spec.suspend {
            info!("Releasing KluctlDeployment {} without deleting deployed objects", key);
            return Ok(Action::await_change());
        }

        let Some(_guard) = self.runner.in_flight().try_acquire(&key) else {
            return Err(ControllerError::Finalizer(format!("cycle of {} is still running", key)));
        };

        let status = obj.status.clone().unwrap_or_default();
        let (Some(project_key), Some(target_key)) = (status.project_key.clone(), status.target_key.clone()) else {
            info!("KluctlDeployment {} was never reconciled, nothing to delete", key);
            return Ok(Action::await_change());
        };

        let target = resolve_target(&self.accessors, obj).await?;
        let cluster = target.accessor.get_k(target.impersonate.as_deref(), &[])?;
        let deletion = DeletionTarget {
            deployment: KluctlDeploymentInfo {
                name: obj.name_any(),
                namespace: obj.namespace().unwrap_or_default(),
                generation: obj.metadata.generation.unwrap_or_default(),
            },
            spec: &obj.spec,
            project_key,
            target_key,
            reconcile_id: uuid::Uuid::new_v4().to_string(),
        };

        let report = delete_deployed_objects(self.runner.store().as_ref(), &cluster, &deletion, Utc::now()).await?;
        if !report.is_complete() {
            let message = format!(
                "failed to delete {} of {} object(s)",
                report.failed.len(),
                report.failed.len() + report.deleted.len() + report.already_gone.len()
            );
            self.update_ready(obj, ConditionStatus::False, reasons::DELETION_FAILED, message.as_str())
                .await?;
            return Err(ControllerError::Finalizer(message));
        }

        info!(
            "Deleted {} object(s) of {} ({} already gone)",
            report.deleted.len(),
            key,
            report.already_gone.len()
        );
        Ok(Action::await_change())
    }

    /// Requeue after a failed reconcile.
    ///
    /// Input errors wait for the resource to change. Everything else backs
    /// off, never longer than the resource's retry interval.
    pub fn error_policy(&self, obj: &KluctlDeployment, error: &ControllerError) -> Action {
        if error.is_terminal() {
            return Action::await_change();
        }
        let key = obj.key();
        self.increment_error(&key);
        let (backoff_seconds, error_count) = self.get_backoff_for_resource(&key);
        let mut delay = Duration::from_secs(backoff_seconds);
        if let Ok(retry_interval) = obj.spec.retry_interval() {
            delay = delay.min(retry_interval);
        }
        warn!(
            "Reconcile of {} failed ({} consecutive errors), retrying in {:?}",
            key, error_count, delay
        );
        Action::requeue(delay)
    }

    /// Get backoff duration for a resource based on error count
    pub fn get_backoff_for_resource(&self, resource_key: &str) -> (u64, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states
                    .entry(resource_key.to_string())
                    .or_insert_with(BackoffState::new);
                let backoff_seconds = state.backoff.next_backoff_seconds();
                (backoff_seconds, state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (60, 0) // 60 seconds default
            }
        }
    }

    /// Increment error count for a resource
    pub fn increment_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states
                .entry(resource_key.to_string())
                .or_insert_with(BackoffState::new)
                .increment_error();
        }
    }

    /// Reset error count for a resource (on successful reconciliation)
    pub fn reset_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_deployment, test_spec, MockPipeline};
    use crds::InvalidSpec;
    use results::MemoryResultStore;

    fn offline_reconciler() -> Reconciler {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        let runner = DeploymentRunner::new(Arc::new(MemoryResultStore::new()), Arc::new(MockPipeline::new()));
        Reconciler::new(client, Arc::new(ClusterAccessorManager::default()), runner)
    }

    #[tokio::test]
    async fn test_backoff_grows_and_resets() {
        let reconciler = offline_reconciler();
        let mut spec = test_spec();
        spec.retry_interval = Some("12s".to_string());
        let obj = test_deployment("app", spec);
        let error = ControllerError::Finalizer("cycle of default/app is still running".to_string());

        let delays: Vec<Action> = (0..4).map(|_| reconciler.error_policy(&obj, &error)).collect();
        assert_eq!(delays[0], Action::requeue(Duration::from_secs(5)));
        assert_eq!(delays[1], Action::requeue(Duration::from_secs(5)));
        assert_eq!(delays[2], Action::requeue(Duration::from_secs(10)));
        // capped at the retry interval
        assert_eq!(delays[3], Action::requeue(Duration::from_secs(12)));

        reconciler.reset_error(&obj.key());
        assert_eq!(reconciler.error_policy(&obj, &error), Action::requeue(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_terminal_errors_wait_for_change() {
        let reconciler = offline_reconciler();
        let obj = test_deployment("app", test_spec());
        let error = ControllerError::InvalidSpec(InvalidSpec::DeployMode("sideways".to_string()));
        assert_eq!(reconciler.error_policy(&obj, &error), Action::await_change());
        assert_eq!(reconciler.get_backoff_for_resource(&obj.key()).1, 0);
    }

    #[tokio::test]
    async fn test_cleanup_without_delete_releases() {
        let reconciler = offline_reconciler();
        let obj = test_deployment("app", test_spec());
        assert_eq!(reconciler.cleanup(&obj).await.unwrap(), Action::await_change());

        let mut spec = test_spec();
        spec.delete = true;
        let never_reconciled = test_deployment("app", spec);
        assert_eq!(reconciler.cleanup(&never_reconciled).await.unwrap(), Action::await_change());
    }
}
