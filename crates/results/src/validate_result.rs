//! Validation results

use crate::command_result::{DeploymentError, KluctlDeploymentInfo, ObjectRef};
use crate::keys::{ProjectKey, TargetKey};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single validation finding for one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResultEntry {
    #[serde(rename = "ref")]
    pub object_ref: ObjectRef,
    pub annotation: String,
    pub message: String,
}

/// Full record of one validation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResult {
    pub id: String,
    #[serde(default)]
    pub reconcile_id: String,
    pub project_key: ProjectKey,
    pub target_key: TargetKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kluctl_deployment: Option<KluctlDeploymentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::schema::preserve_unknown_fields")]
    pub overrides_patch: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_objects_hash: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<DeploymentError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<DeploymentError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ValidateResultEntry>,
}

/// Listing projection of a [`ValidateResult`]: identity plus counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResultSummary {
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
    pub ready: bool,

    #[serde(default)]
    pub warnings: usize,
    #[serde(default)]
    pub errors: usize,
    #[serde(default)]
    pub results: usize,
}

impl ValidateResult {
    /// Projects this result onto its summary
    pub fn build_summary(&self) -> ValidateResultSummary {
        ValidateResultSummary {
            id: self.id.clone(),
            reconcile_id: self.reconcile_id.clone(),
            project_key: self.project_key.clone(),
            target_key: self.target_key.clone(),
            kluctl_deployment: self.kluctl_deployment.clone(),
            rendered_objects_hash: self.rendered_objects_hash.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            ready: self.ready,
            warnings: self.warnings.len(),
            errors: self.errors.len(),
            results: self.results.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_summary_counts() {
        let vr = ValidateResult {
            id: "v1".into(),
            ready: false,
            errors: vec![DeploymentError::global("not ready")],
            results: vec![
                ValidateResultEntry {
                    object_ref: ObjectRef::new("apps", "v1", "Deployment", "default", "web"),
                    annotation: "validate-result.kluctl.io/readiness".into(),
                    message: "0/1 replicas ready".into(),
                },
                ValidateResultEntry {
                    object_ref: ObjectRef::new("apps", "v1", "Deployment", "default", "api"),
                    annotation: "validate-result.kluctl.io/readiness".into(),
                    message: "0/2 replicas ready".into(),
                },
            ],
            ..Default::default()
        };

        let s = vr.build_summary();
        assert_eq!(s.id, "v1");
        assert!(!s.ready);
        assert_eq!(s.errors, 1);
        assert_eq!(s.warnings, 0);
        assert_eq!(s.results, 2);
    }
}
