//! Helpers shared by the reconcile steps.
//!
//! - objects hash used for change detection and manual approval
//! - overrides (JSON merge patch) and the status patch diff
//! - builders turning pipeline outputs into stored results

use crate::pipeline::{CommandOutput, DriftOutput, PipelineContext, ValidateOutput};
use chrono::{DateTime, Utc};
use crds::KluctlDeploymentSpec;
use results::{CommandInfo, CommandResult, DeploymentError, DriftDetectionResult, ValidateResult};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Initiator recorded in results written by the controller
pub const INITIATOR: &str = "KluctlDeployment";

/// Deterministic hash of a rendered object set.
///
/// Independent of object order and of key order inside objects.
pub fn objects_hash(objects: &[Value]) -> String {
    let mut serialized: Vec<String> = objects.iter().map(|o| canonicalize(o).to_string()).collect();
    serialized.sort();

    let mut hasher = Sha256::new();
    for s in &serialized {
        hasher.update(s.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Copy of `value` with all object keys in sorted order
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for k in keys {
                sorted.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Merge patch turning `old` into `new`, `None` when they are equal.
///
/// Keys missing in `new` are set to `null` so the patch removes them. Status
/// fields are skipped when empty, so a plain merge of the new status could
/// never clear them.
pub fn merge_patch_diff(old: &Value, new: &Value) -> Option<Value> {
    if old == new {
        return None;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (k, new_v) in new_map {
                match old_map.get(k) {
                    Some(old_v) => {
                        if let Some(p) = merge_patch_diff(old_v, new_v) {
                            patch.insert(k.clone(), p);
                        }
                    }
                    None => {
                        patch.insert(k.clone(), new_v.clone());
                    }
                }
            }
            for k in old_map.keys() {
                if !new_map.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(new.clone()),
    }
}

/// Spec with the overrides of a manual request applied
pub fn apply_overrides(
    spec: &KluctlDeploymentSpec,
    overrides_patch: Option<&Value>,
) -> Result<KluctlDeploymentSpec, serde_json::Error> {
    let Some(patch) = overrides_patch else {
        return Ok(spec.clone());
    };
    let mut value = serde_json::to_value(spec)?;
    json_patch::merge(&mut value, patch);
    serde_json::from_value(value)
}

/// Command metadata as recorded in a result
pub fn command_info(
    spec: &KluctlDeploymentSpec,
    command: &str,
    dry_run: bool,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> CommandInfo {
    CommandInfo {
        initiator: INITIATOR.to_string(),
        start_time,
        end_time,
        command: command.to_string(),
        target: spec.target.clone(),
        target_name_override: spec.target_name_override.clone(),
        context_override: spec.context.clone(),
        args: spec.args.clone(),
        dry_run,
        no_wait: spec.no_wait,
        force_apply: spec.force_apply,
        replace_on_error: spec.replace_on_error,
        force_replace_on_error: spec.force_replace_on_error,
        abort_on_error: spec.abort_on_error,
        include_tags: spec.include_tags.clone(),
        exclude_tags: spec.exclude_tags.clone(),
        include_deployment_dirs: spec.include_deployment_dirs.clone(),
        exclude_deployment_dirs: spec.exclude_deployment_dirs.clone(),
    }
}

/// Timing and identity of one command run
#[derive(Debug, Clone)]
pub struct CommandRun<'a> {
    pub ctx: &'a PipelineContext,
    pub command: &'a str,
    pub dry_run: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub rendered_objects_hash: Option<String>,
}

impl CommandRun<'_> {
    /// Result of a command that produced an outcome
    pub fn command_result(&self, output: CommandOutput) -> CommandResult {
        CommandResult {
            id: results::new_result_id(),
            reconcile_id: self.ctx.reconcile_id.clone(),
            project_key: self.ctx.project_key.clone(),
            target_key: self.ctx.target_key.clone(),
            command: command_info(&self.ctx.spec, self.command, self.dry_run, self.start_time, self.end_time),
            kluctl_deployment: Some(self.ctx.deployment.clone()),
            rendered_objects_hash: self.rendered_objects_hash.clone(),
            objects: output.objects,
            errors: output.errors,
            warnings: output.warnings,
        }
    }

    /// Result of a command that failed as a whole
    pub fn errored_result(&self, message: impl Into<String>) -> CommandResult {
        self.command_result(CommandOutput {
            errors: vec![DeploymentError::global(message)],
            ..Default::default()
        })
    }

    pub fn validate_result(&self, output: ValidateOutput) -> ValidateResult {
        ValidateResult {
            id: results::new_result_id(),
            reconcile_id: self.ctx.reconcile_id.clone(),
            project_key: self.ctx.project_key.clone(),
            target_key: self.ctx.target_key.clone(),
            kluctl_deployment: Some(self.ctx.deployment.clone()),
            overrides_patch: self.ctx.overrides_patch.clone(),
            rendered_objects_hash: self.rendered_objects_hash.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            ready: output.ready,
            warnings: output.warnings,
            errors: output.errors,
            results: output.results,
        }
    }

    pub fn drift_result(&self, output: DriftOutput) -> DriftDetectionResult {
        DriftDetectionResult {
            id: results::new_result_id(),
            reconcile_id: self.ctx.reconcile_id.clone(),
            project_key: self.ctx.project_key.clone(),
            target_key: self.ctx.target_key.clone(),
            kluctl_deployment: Some(self.ctx.deployment.clone()),
            rendered_objects_hash: self.rendered_objects_hash.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            objects: output.objects,
            warnings: output.warnings,
            errors: output.errors,
        }
    }
}

#[cfg(test)]
#[path = "reconcile_helpers_test.rs"]
mod reconcile_helpers_test;
