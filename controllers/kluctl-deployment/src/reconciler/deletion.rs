//! Deletion of deployed objects when a KluctlDeployment with `delete: true`
//! goes away.
//!
//! The object list comes from the result store: everything applied by a
//! real (non dry-run) deploy or poke-images command of the same project and
//! target. Hooks, orphans and objects already reported deleted are skipped.

use crate::reconcile_helpers::command_info;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_accessor::{DeletionReport, K8sCluster};
use crds::KluctlDeploymentSpec;
use results::{
    CommandResult, DeploymentError, GetCommandResultOptions, KluctlDeploymentInfo,
    ListCommandResultSummariesOptions, ObjectRef, ProjectKey, ResultObject, ResultStore, ResultStoreError,
    TargetKey,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Deletes objects on the target cluster
#[async_trait]
pub trait ObjectDeleter: Send + Sync {
    async fn delete_objects(&self, objects: &[ObjectRef]) -> DeletionReport;
}

#[async_trait]
impl ObjectDeleter for K8sCluster {
    async fn delete_objects(&self, objects: &[ObjectRef]) -> DeletionReport {
        K8sCluster::delete_objects(self, objects).await
    }
}

/// Objects applied to `target` by earlier deploys, deduplicated and sorted
pub async fn applied_objects(
    store: &dyn ResultStore,
    project: &ProjectKey,
    target: &TargetKey,
) -> Result<Vec<ObjectRef>, ResultStoreError> {
    let summaries = store
        .list_command_result_summaries(&ListCommandResultSummariesOptions::for_project(project.clone()))
        .await?;

    let mut refs = BTreeSet::new();
    for summary in summaries {
        if summary.target_key != *target || !results::is_applying(&summary) {
            continue;
        }
        let options = GetCommandResultOptions {
            id: summary.id.clone(),
            reduced: true,
        };
        let Some(cr) = store.get_command_result(&options).await? else {
            debug!("Result {} vanished while collecting objects", summary.id);
            continue;
        };
        refs.extend(
            cr.objects
                .into_iter()
                .filter(|o| !o.orphan && !o.deleted && !o.hook)
                .map(|o| o.object_ref),
        );
    }
    Ok(refs.into_iter().collect())
}

/// What a deletion run is about
#[derive(Debug, Clone)]
pub struct DeletionTarget<'a> {
    pub deployment: KluctlDeploymentInfo,
    pub spec: &'a KluctlDeploymentSpec,
    pub project_key: ProjectKey,
    pub target_key: TargetKey,
    pub reconcile_id: String,
}

/// Deletes every applied object and records the run as a `delete` result.
///
/// Objects that are already gone count as deleted. The returned report is
/// incomplete when at least one object could not be deleted.
pub async fn delete_deployed_objects(
    store: &dyn ResultStore,
    deleter: &dyn ObjectDeleter,
    target: &DeletionTarget<'_>,
    start_time: DateTime<Utc>,
) -> Result<DeletionReport, ResultStoreError> {
    let refs = applied_objects(store, &target.project_key, &target.target_key).await?;
    info!(
        "Deleting {} object(s) of {}/{}",
        refs.len(),
        target.deployment.namespace,
        target.deployment.name
    );

    let report = deleter.delete_objects(&refs).await;

    let objects = report
        .deleted
        .iter()
        .chain(report.already_gone.iter())
        .map(|r| ResultObject {
            object_ref: r.clone(),
            deleted: true,
            ..Default::default()
        })
        .collect();
    let errors = report
        .failed
        .iter()
        .map(|(r, message)| DeploymentError {
            object_ref: r.clone(),
            message: message.clone(),
        })
        .collect();

    let cr = CommandResult {
        id: results::new_result_id(),
        reconcile_id: target.reconcile_id.clone(),
        project_key: target.project_key.clone(),
        target_key: target.target_key.clone(),
        command: command_info(target.spec, "delete", false, start_time, Utc::now()),
        kluctl_deployment: Some(target.deployment.clone()),
        rendered_objects_hash: None,
        objects,
        errors,
        warnings: Vec::new(),
    };
    store.write_command_result(&cr).await?;

    Ok(report)
}
