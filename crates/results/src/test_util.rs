//! Builders for results used in tests of this crate and its dependents

use crate::command_result::{Change, CommandInfo, CommandResult, ObjectRef, ResultObject};
use crate::keys::{ProjectKey, RepoKey, TargetKey};
use chrono::{DateTime, Utc};

/// Project key for `https://example.com/<repo>` at the repository root
pub fn project_key(repo: &str) -> ProjectKey {
    ProjectKey {
        repo_key: RepoKey::parse_git_url(&format!("https://example.com/{}", repo))
            .unwrap_or_default(),
        sub_dir: String::new(),
    }
}

/// Target key with only a name
pub fn target_key(name: &str) -> TargetKey {
    TargetKey {
        target_name: name.to_string(),
        ..Default::default()
    }
}

/// Empty command result with the given identity and timing
pub fn command_result(
    id: &str,
    project: ProjectKey,
    target: TargetKey,
    command: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> CommandResult {
    CommandResult {
        id: id.to_string(),
        project_key: project,
        target_key: target,
        command: CommandInfo {
            start_time: start,
            end_time: end,
            command: command.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Reference to a ConfigMap in `default`
pub fn config_map_ref(name: &str) -> ObjectRef {
    ObjectRef::new("", "v1", "ConfigMap", "default", name)
}

/// Object applied for the first time
pub fn new_object(r: ObjectRef) -> ResultObject {
    let body = serde_json::json!({"kind": r.kind, "metadata": {"name": r.name}});
    ResultObject {
        object_ref: r,
        new: true,
        rendered: Some(body.clone()),
        applied: Some(body),
        ..Default::default()
    }
}

/// Object applied with one changed field
pub fn changed_object(r: ObjectRef, json_path: &str) -> ResultObject {
    let body = serde_json::json!({"kind": r.kind, "metadata": {"name": r.name}});
    ResultObject {
        object_ref: r,
        changes: vec![Change {
            change_type: "update".to_string(),
            json_path: json_path.to_string(),
            unified_diff: None,
        }],
        rendered: Some(body.clone()),
        remote: Some(body.clone()),
        applied: Some(body),
        ..Default::default()
    }
}

/// Object present on the cluster but no longer rendered
pub fn orphan_object(r: ObjectRef) -> ResultObject {
    ResultObject {
        object_ref: r,
        orphan: true,
        remote: Some(serde_json::json!({})),
        ..Default::default()
    }
}

/// Object removed by prune or delete
pub fn deleted_object(r: ObjectRef) -> ResultObject {
    ResultObject {
        object_ref: r,
        deleted: true,
        ..Default::default()
    }
}
