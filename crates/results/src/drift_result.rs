//! Drift detection results
//!
//! Drift detection is a read-only comparison of the live cluster state against
//! the rendered objects. It never changes the cluster.

use crate::command_result::{DeploymentError, KluctlDeploymentInfo, ResultObject};
use crate::keys::{ProjectKey, TargetKey};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Full record of one drift detection run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriftDetectionResult {
    pub id: String,
    #[serde(default)]
    pub reconcile_id: String,
    pub project_key: ProjectKey,
    pub target_key: TargetKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kluctl_deployment: Option<KluctlDeploymentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_objects_hash: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ResultObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<DeploymentError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<DeploymentError>,
}

/// Listing projection of a [`DriftDetectionResult`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriftDetectionResultSummary {
    pub id: String,
    #[serde(default)]
    pub reconcile_id: String,
    pub project_key: ProjectKey,
    pub target_key: TargetKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_objects_hash: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    #[serde(default)]
    pub changed_objects: usize,
    #[serde(default)]
    pub new_objects: usize,
    #[serde(default)]
    pub orphan_objects: usize,
    #[serde(default)]
    pub warnings: usize,
    #[serde(default)]
    pub errors: usize,
}

impl DriftDetectionResult {
    fn count(&self, f: impl Fn(&ResultObject) -> bool) -> usize {
        self.objects.iter().filter(|o| f(o)).count()
    }

    /// Projects this result onto its summary
    pub fn build_summary(&self) -> DriftDetectionResultSummary {
        DriftDetectionResultSummary {
            id: self.id.clone(),
            reconcile_id: self.reconcile_id.clone(),
            project_key: self.project_key.clone(),
            target_key: self.target_key.clone(),
            rendered_objects_hash: self.rendered_objects_hash.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            changed_objects: self.count(|o| !o.changes.is_empty()),
            new_objects: self.count(|o| o.new),
            orphan_objects: self.count(|o| o.orphan),
            warnings: self.warnings.len(),
            errors: self.errors.len(),
        }
    }

    /// One-line description for the resource status, `NoDrift` when nothing
    /// differs.
    pub fn build_short_message(&self) -> String {
        let s = self.build_summary();
        if s.changed_objects == 0 && s.new_objects == 0 && s.orphan_objects == 0 {
            return "NoDrift".to_string();
        }
        format!(
            "changed={}, new={}, orphan={}",
            s.changed_objects, s.new_objects, s.orphan_objects
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_result::Change;

    #[test]
    fn test_no_drift() {
        let dr = DriftDetectionResult::default();
        assert_eq!(dr.build_short_message(), "NoDrift");
    }

    #[test]
    fn test_drift_message() {
        let mut changed = ResultObject::default();
        changed.changes.push(Change {
            change_type: "update".into(),
            json_path: "spec.replicas".into(),
            unified_diff: None,
        });
        let mut new = ResultObject::default();
        new.new = true;
        let dr = DriftDetectionResult {
            objects: vec![changed, new],
            ..Default::default()
        };

        assert_eq!(dr.build_short_message(), "changed=1, new=1, orphan=0");
        let s = dr.build_summary();
        assert_eq!(s.changed_objects, 1);
        assert_eq!(s.new_objects, 1);
    }
}
