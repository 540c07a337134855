//! Unit tests for reconcile_helpers module

use crate::reconcile_helpers::*;
use crate::test_utils::{pipeline_context, test_spec};
use crate::pipeline::CommandOutput;
use chrono::Utc;
use results::test_util::{config_map_ref, new_object};
use serde_json::json;

#[test]
fn test_objects_hash_is_order_independent() {
    let a = json!({"kind": "ConfigMap", "metadata": {"name": "a", "namespace": "default"}});
    let b = json!({"kind": "Secret", "metadata": {"name": "b"}});
    let a_reordered = json!({"metadata": {"namespace": "default", "name": "a"}, "kind": "ConfigMap"});

    let h1 = objects_hash(&[a.clone(), b.clone()]);
    let h2 = objects_hash(&[b.clone(), a_reordered]);
    assert_eq!(h1, h2);
    assert_eq!(h1.len(), 64);

    let changed = json!({"kind": "ConfigMap", "metadata": {"name": "a2", "namespace": "default"}});
    assert_ne!(h1, objects_hash(&[changed, b]));
    assert_ne!(objects_hash(&[]), h1);
}

#[test]
fn test_merge_patch_diff_equal() {
    let v = json!({"a": 1, "b": {"c": [1, 2]}});
    assert_eq!(merge_patch_diff(&v, &v), None);
}

#[test]
fn test_merge_patch_diff_changes_and_removals() {
    let old = json!({"a": 1, "b": {"c": 2, "d": 3}, "gone": "x"});
    let new = json!({"a": 1, "b": {"c": 5, "d": 3}, "added": true});
    let patch = merge_patch_diff(&old, &new).unwrap();
    assert_eq!(patch, json!({"b": {"c": 5}, "added": true, "gone": null}));

    let mut applied = old.clone();
    json_patch::merge(&mut applied, &patch);
    assert_eq!(applied, new);
}

#[test]
fn test_merge_patch_diff_replaces_arrays() {
    let old = json!({"conditions": [{"type": "Ready", "status": "False"}]});
    let new = json!({"conditions": [{"type": "Ready", "status": "True"}]});
    assert_eq!(merge_patch_diff(&old, &new).unwrap(), new);
}

#[test]
fn test_apply_overrides() {
    let spec = test_spec();
    assert_eq!(apply_overrides(&spec, None).unwrap().args, spec.args);

    let patched = apply_overrides(&spec, Some(&json!({"args": {"env": "staging"}, "dryRun": true}))).unwrap();
    assert_eq!(patched.args, Some(json!({"env": "staging"})));
    assert!(patched.dry_run);
    assert_eq!(patched.interval, spec.interval);

    // null removes, nested objects merge
    let mut spec = test_spec();
    spec.target = Some("prod".to_string());
    spec.args = Some(json!({"env": "prod", "replicas": 3}));
    let patched = apply_overrides(&spec, Some(&json!({"target": null, "args": {"replicas": null, "debug": true}}))).unwrap();
    assert_eq!(patched.target, None);
    assert_eq!(patched.args, Some(json!({"env": "prod", "debug": true})));
}

#[test]
fn test_command_run_results() {
    let ctx = pipeline_context(test_spec());
    let now = Utc::now();
    let run = CommandRun {
        ctx: &ctx,
        command: "deploy",
        dry_run: false,
        start_time: now,
        end_time: now,
        rendered_objects_hash: Some("h".to_string()),
    };

    let ok = run.command_result(CommandOutput {
        objects: vec![new_object(config_map_ref("cm1"))],
        ..Default::default()
    });
    assert_eq!(ok.command.command, "deploy");
    assert_eq!(ok.command.initiator, INITIATOR);
    assert_eq!(ok.reconcile_id, ctx.reconcile_id);
    assert_eq!(ok.build_summary().new_objects, 1);

    let failed = run.errored_result("boom");
    assert_ne!(failed.id, ok.id);
    assert_eq!(failed.errors.len(), 1);
    assert_eq!(failed.errors[0].message, "boom");
}
