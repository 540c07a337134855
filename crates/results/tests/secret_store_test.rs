//! Integration tests for the Secret-backed result store
//!
//! These tests require a reachable Kubernetes cluster (current kubeconfig
//! context). Each test works in its own namespace and deletes it afterwards.

use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
use results::{
    CommandInfo, CommandResult, ListCommandResultSummariesOptions, ProjectKey, RepoKey,
    ResultObject, ResultStore, RetentionPolicy, SecretResultStore, TargetKey,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn test_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns: Namespace = serde_json::from_value(serde_json::json!({
        "metadata": {"name": name}
    }))
    .expect("namespace json");
    let _ = api.create(&PostParams::default(), &ns).await;
}

async fn drop_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;
}

fn project() -> ProjectKey {
    ProjectKey::new(RepoKey::parse_git_url("https://example.com/results-test.git").expect("url"), "")
}

fn result(id: &str, offset_secs: i64, command: &str, objects: Vec<ResultObject>) -> CommandResult {
    let start = Utc::now() + ChronoDuration::seconds(offset_secs);
    CommandResult {
        id: id.to_string(),
        project_key: project(),
        target_key: TargetKey {
            target_name: "test".to_string(),
            ..Default::default()
        },
        command: CommandInfo {
            start_time: start,
            end_time: start + ChronoDuration::seconds(1),
            command: command.to_string(),
            ..Default::default()
        },
        objects,
        ..Default::default()
    }
}

#[tokio::test]
#[ignore] // Requires a running Kubernetes cluster
async fn test_write_list_get() {
    let client = Client::try_default().await.expect("kube client");
    let ns = "results-test-write";
    test_namespace(&client, ns).await;

    let store = SecretResultStore::new(client.clone(), ns, RetentionPolicy::default());
    let first = result(&results::new_result_id(), 0, "deploy", vec![ResultObject {
        new: true,
        applied: Some(serde_json::json!({})),
        ..Default::default()
    }]);
    let second = result(&results::new_result_id(), 2, "deploy", vec![]);
    store.write_command_result(&first).await.expect("write first");
    store.write_command_result(&second).await.expect("write second");

    let list = store
        .list_command_result_summaries(&ListCommandResultSummariesOptions::for_project(project()))
        .await
        .expect("list");
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].id, second.id);
    assert_eq!(list[1].new_objects, 1);

    assert!(store.has_command_result(&first.id).await.expect("has"));
    let reduced = store
        .get_command_result(&results::GetCommandResultOptions { id: first.id.clone(), reduced: true })
        .await
        .expect("get")
        .expect("present");
    assert!(reduced.objects[0].applied.is_none());

    drop_namespace(&client, ns).await;
}

#[tokio::test]
#[ignore] // Requires a running Kubernetes cluster
async fn test_watch_after_list() {
    let client = Client::try_default().await.expect("kube client");
    let ns = "results-test-watch";
    test_namespace(&client, ns).await;

    let store = SecretResultStore::new(client.clone(), ns, RetentionPolicy::default());
    let existing = result(&results::new_result_id(), 0, "deploy", vec![]);
    store.write_command_result(&existing).await.expect("write");

    let cancel = CancellationToken::new();
    let mut watch = store
        .watch_command_result_summaries(&ListCommandResultSummariesOptions::for_project(project()), cancel.clone())
        .await
        .expect("watch");
    assert_eq!(watch.snapshot.len(), 1);

    let fresh = result(&results::new_result_id(), 2, "deploy", vec![]);
    store.write_command_result(&fresh).await.expect("write");

    let ev = tokio::time::timeout(Duration::from_secs(10), watch.events.next())
        .await
        .expect("event in time")
        .expect("stream open")
        .expect("watch event");
    assert_eq!(ev.summary.id, fresh.id);
    assert!(!ev.delete);

    cancel.cancel();
    drop_namespace(&client, ns).await;
}
