//! Command results
//!
//! A [`CommandResult`] is the full, immutable record of one executed command
//! (deploy, diff, prune, delete, poke-images). A [`CommandResultSummary`] is
//! a cheap projection carrying only identity and counters, used for listing.

use crate::keys::{ProjectKey, TargetKey};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a Kubernetes object touched by a command
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl ObjectRef {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gk = if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.group)
        };
        if self.namespace.is_empty() {
            write!(f, "{}/{}", gk, self.name)
        } else {
            write!(f, "{}/{}/{}", self.namespace, gk, self.name)
        }
    }
}

/// A single field-level change of an object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// `insert`, `delete` or `update`
    #[serde(rename = "type")]
    pub change_type: String,
    pub json_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unified_diff: Option<String>,
}

/// Error or warning attached to a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentError {
    #[serde(rename = "ref", default)]
    pub object_ref: ObjectRef,
    pub message: String,
}

impl DeploymentError {
    /// Error not bound to a specific object
    pub fn global(message: impl Into<String>) -> Self {
        Self {
            object_ref: ObjectRef::default(),
            message: message.into(),
        }
    }
}

/// Per-object outcome of a command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultObject {
    #[serde(rename = "ref")]
    pub object_ref: ObjectRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<Change>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub new: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub orphan: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hook: bool,
    /// Object as rendered from the project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::schema::preserve_unknown_fields")]
    pub rendered: Option<serde_json::Value>,
    /// Object as found on the cluster before the command ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::schema::preserve_unknown_fields")]
    pub remote: Option<serde_json::Value>,
    /// Object as returned by the cluster after applying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::schema::preserve_unknown_fields")]
    pub applied: Option<serde_json::Value>,
}

/// Identity of the KluctlDeployment that produced a result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KluctlDeploymentInfo {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub generation: i64,
}

/// What was executed, when, and with which flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initiator: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Command name (`deploy`, `diff`, `prune`, `delete`, `poke-images`)
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::schema::preserve_unknown_fields")]
    pub args: Option<serde_json::Value>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub force_apply: bool,
    #[serde(default)]
    pub replace_on_error: bool,
    #[serde(default)]
    pub force_replace_on_error: bool,
    #[serde(default)]
    pub abort_on_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_deployment_dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_deployment_dirs: Vec<String>,
}

/// Full record of one executed command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub id: String,
    #[serde(default)]
    pub reconcile_id: String,
    pub project_key: ProjectKey,
    pub target_key: TargetKey,
    pub command: CommandInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kluctl_deployment: Option<KluctlDeploymentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_objects_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ResultObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<DeploymentError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<DeploymentError>,
}

/// Listing projection of a [`CommandResult`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultSummary {
    pub id: String,
    #[serde(default)]
    pub reconcile_id: String,
    pub project_key: ProjectKey,
    pub target_key: TargetKey,
    pub command_info: CommandInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kluctl_deployment: Option<KluctlDeploymentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_objects_hash: Option<String>,

    #[serde(default)]
    pub rendered_objects: usize,
    #[serde(default)]
    pub remote_objects: usize,
    #[serde(default)]
    pub applied_objects: usize,
    #[serde(default)]
    pub applied_hook_objects: usize,
    #[serde(default)]
    pub new_objects: usize,
    #[serde(default)]
    pub changed_objects: usize,
    #[serde(default)]
    pub orphan_objects: usize,
    #[serde(default)]
    pub deleted_objects: usize,
    #[serde(default)]
    pub errors: usize,
    #[serde(default)]
    pub warnings: usize,
    #[serde(default)]
    pub total_changes: usize,
}

impl CommandResult {
    /// Projects this result onto its summary. Summaries are never maintained
    /// on their own; this is the only place counters are computed.
    pub fn build_summary(&self) -> CommandResultSummary {
        let mut summary = CommandResultSummary {
            id: self.id.clone(),
            reconcile_id: self.reconcile_id.clone(),
            project_key: self.project_key.clone(),
            target_key: self.target_key.clone(),
            command_info: self.command.clone(),
            kluctl_deployment: self.kluctl_deployment.clone(),
            rendered_objects_hash: self.rendered_objects_hash.clone(),
            errors: self.errors.len(),
            warnings: self.warnings.len(),
            ..Default::default()
        };

        for o in &self.objects {
            if o.rendered.is_some() {
                summary.rendered_objects += 1;
            }
            if o.remote.is_some() {
                summary.remote_objects += 1;
            }
            if o.applied.is_some() {
                if o.hook {
                    summary.applied_hook_objects += 1;
                } else {
                    summary.applied_objects += 1;
                }
            }
            if o.new {
                summary.new_objects += 1;
            }
            if !o.changes.is_empty() {
                summary.changed_objects += 1;
                summary.total_changes += o.changes.len();
            }
            if o.orphan {
                summary.orphan_objects += 1;
            }
            if o.deleted {
                summary.deleted_objects += 1;
            }
        }

        summary
    }

    /// Variant without the large per-object payloads
    pub fn to_reduced(&self) -> CommandResult {
        let mut reduced = self.clone();
        for o in &mut reduced.objects {
            o.rendered = None;
            o.remote = None;
            o.applied = None;
            for c in &mut o.changes {
                c.unified_diff = None;
            }
        }
        reduced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str) -> ResultObject {
        ResultObject {
            object_ref: ObjectRef::new("", "v1", "ConfigMap", "default", name),
            rendered: Some(serde_json::json!({"kind": "ConfigMap"})),
            ..Default::default()
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut new_cm = object("cm");
        new_cm.new = true;
        new_cm.applied = new_cm.rendered.clone();

        let mut changed = object("cm2");
        changed.remote = Some(serde_json::json!({}));
        changed.applied = changed.rendered.clone();
        changed.changes = vec![
            Change { change_type: "update".into(), json_path: "data.a".into(), unified_diff: None },
            Change { change_type: "insert".into(), json_path: "data.b".into(), unified_diff: None },
        ];

        let mut hook = object("hook");
        hook.hook = true;
        hook.applied = hook.rendered.clone();

        let mut orphan = ResultObject::default();
        orphan.orphan = true;

        let result = CommandResult {
            id: "id-1".into(),
            objects: vec![new_cm, changed, hook, orphan],
            errors: vec![DeploymentError::global("boom")],
            ..Default::default()
        };

        let s = result.build_summary();
        assert_eq!(s.id, "id-1");
        assert_eq!(s.rendered_objects, 3);
        assert_eq!(s.remote_objects, 1);
        assert_eq!(s.applied_objects, 2);
        assert_eq!(s.applied_hook_objects, 1);
        assert_eq!(s.new_objects, 1);
        assert_eq!(s.changed_objects, 1);
        assert_eq!(s.total_changes, 2);
        assert_eq!(s.orphan_objects, 1);
        assert_eq!(s.deleted_objects, 0);
        assert_eq!(s.errors, 1);
        assert_eq!(s.warnings, 0);
    }

    #[test]
    fn test_reduced_drops_payloads_but_keeps_counters() {
        let mut o = object("cm");
        o.applied = o.rendered.clone();
        o.changes = vec![Change {
            change_type: "update".into(),
            json_path: "data.a".into(),
            unified_diff: Some("-a\n+b".into()),
        }];
        let result = CommandResult { id: "x".into(), objects: vec![o], ..Default::default() };

        let reduced = result.to_reduced();
        assert!(reduced.objects[0].rendered.is_none());
        assert!(reduced.objects[0].applied.is_none());
        assert!(reduced.objects[0].changes[0].unified_diff.is_none());
        assert_eq!(reduced.objects[0].changes.len(), 1);
        assert_eq!(result.build_summary().changed_objects, reduced.build_summary().changed_objects);
    }
}
