//! Result store backed by Kubernetes Secrets
//!
//! Every result is stored as its own Secret in a dedicated namespace:
//!
//! - name: `cr-<id>` (command), `vr-<id>` (validate), `dr-<id>` (drift)
//! - labels: result kind plus hashed project and target identity, so listing
//!   and watching can be narrowed server-side
//! - annotation `kluctl.io/result-summary`: the summary as JSON, so listing
//!   never has to decode full results
//! - data keys `result` and `reducedResult`: full and reduced payload
//!
//! Secrets are written with server-side apply, which replaces the whole object
//! atomically. Readers therefore always see one complete write.

use crate::command_result::{CommandResult, CommandResultSummary};
use crate::drift_result::DriftDetectionResult;
use crate::error::ResultStoreError;
use crate::keys::{ProjectKey, TargetKey};
use crate::store::{
    filter_project, filter_summary, select_for_cleanup, sort_summaries, CommandResultSummaryWatch,
    GetCommandResultOptions, ListCommandResultSummariesOptions, ResultStore, RetentionPolicy,
    WatchCommandResultSummaryEvent,
};
use crate::validate_result::{ValidateResult, ValidateResultSummary};
use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Namespace used when none is configured
pub const DEFAULT_RESULTS_NAMESPACE: &str = "kluctl-results";

const FIELD_MANAGER: &str = "kluctl-results";

const LABEL_KIND: &str = "kluctl.io/result-kind";
const LABEL_ID: &str = "kluctl.io/result-id";
const LABEL_PROJECT: &str = "kluctl.io/result-project-hash";
const LABEL_TARGET: &str = "kluctl.io/result-target-hash";
const ANNOTATION_SUMMARY: &str = "kluctl.io/result-summary";

const DATA_RESULT: &str = "result";
const DATA_REDUCED_RESULT: &str = "reducedResult";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    Command,
    Validate,
    Drift,
}

impl ResultKind {
    fn label(self) -> &'static str {
        match self {
            ResultKind::Command => "CommandResult",
            ResultKind::Validate => "ValidateResult",
            ResultKind::Drift => "DriftDetectionResult",
        }
    }

    fn secret_name(self, id: &str) -> String {
        let prefix = match self {
            ResultKind::Command => "cr",
            ResultKind::Validate => "vr",
            ResultKind::Drift => "dr",
        };
        format!("{}-{}", prefix, id)
    }
}

/// Label-safe hash of any serializable identity
fn identity_hash<T: Serialize>(v: &T) -> Result<String, ResultStoreError> {
    let json = serde_json::to_vec(v)?;
    let digest = Sha256::digest(&json);
    let mut h = hex::encode(digest);
    h.truncate(32);
    Ok(h)
}

fn selector(kind: ResultKind, project: Option<&ProjectKey>) -> Result<String, ResultStoreError> {
    let mut s = format!("{}={}", LABEL_KIND, kind.label());
    if let Some(p) = project {
        s.push_str(&format!(",{}={}", LABEL_PROJECT, identity_hash(p)?));
    }
    Ok(s)
}

fn decode_data<T: DeserializeOwned>(secret: &Secret, key: &str) -> Result<T, ResultStoreError> {
    let name = secret.metadata.name.as_deref().unwrap_or("<unknown>");
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| ResultStoreError::Invalid(format!("secret {} has no {} key", name, key)))?;
    Ok(serde_json::from_slice(&bytes.0)?)
}

fn decode_summary<T: DeserializeOwned>(secret: &Secret) -> Result<T, ResultStoreError> {
    let name = secret.metadata.name.as_deref().unwrap_or("<unknown>");
    let raw = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_SUMMARY))
        .ok_or_else(|| ResultStoreError::Invalid(format!("secret {} has no summary annotation", name)))?;
    Ok(serde_json::from_str(raw)?)
}

/// Result store persisting results as Secrets in one namespace
#[derive(Clone)]
pub struct SecretResultStore {
    api: Api<Secret>,
    namespace: String,
    retention: RetentionPolicy,
}

impl std::fmt::Debug for SecretResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretResultStore")
            .field("namespace", &self.namespace)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl SecretResultStore {
    /// Creates a store writing into `namespace`
    pub fn new(client: Client, namespace: impl Into<String>, retention: RetentionPolicy) -> Self {
        let namespace = namespace.into();
        info!(
            "Using Secret result store in namespace {} (keep_count={}, keep_age={:?})",
            namespace, retention.keep_count, retention.keep_age
        );
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            retention,
        }
    }

    #[allow(clippy::too_many_arguments, reason = "one argument per stored part")]
    async fn apply_secret<F: Serialize, R: Serialize, S: Serialize>(
        &self,
        kind: ResultKind,
        id: &str,
        project: &ProjectKey,
        target: &TargetKey,
        summary: &S,
        full: &F,
        reduced: Option<&R>,
    ) -> Result<(), ResultStoreError> {
        let name = kind.secret_name(id);

        let labels = BTreeMap::from([
            (LABEL_KIND.to_string(), kind.label().to_string()),
            (LABEL_ID.to_string(), id.to_string()),
            (LABEL_PROJECT.to_string(), identity_hash(project)?),
            (LABEL_TARGET.to_string(), identity_hash(target)?),
        ]);
        let annotations = BTreeMap::from([(ANNOTATION_SUMMARY.to_string(), serde_json::to_string(summary)?)]);

        let mut data = BTreeMap::from([(DATA_RESULT.to_string(), ByteString(serde_json::to_vec(full)?))]);
        if let Some(reduced) = reduced {
            data.insert(DATA_REDUCED_RESULT.to_string(), ByteString(serde_json::to_vec(reduced)?));
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        self.api
            .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await?;
        debug!("Wrote {} {}", kind.label(), name);
        Ok(())
    }

    async fn get_secret(&self, kind: ResultKind, id: &str) -> Result<Option<Secret>, ResultStoreError> {
        Ok(self.api.get_opt(&kind.secret_name(id)).await?)
    }

    async fn list_secrets(
        &self,
        kind: ResultKind,
        project: Option<&ProjectKey>,
    ) -> Result<Vec<Secret>, ResultStoreError> {
        let lp = ListParams::default().labels(&selector(kind, project)?);
        Ok(self.api.list(&lp).await?.items)
    }

    fn summaries_from(
        secrets: &[Secret],
        filter: Option<&ProjectKey>,
    ) -> Vec<CommandResultSummary> {
        let mut ret: Vec<CommandResultSummary> = secrets
            .iter()
            .filter_map(|s| match decode_summary::<CommandResultSummary>(s) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!("Skipping unreadable result secret: {}", e);
                    None
                }
            })
            .filter(|s| filter_summary(s, filter))
            .collect();
        sort_summaries(&mut ret);
        ret
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ResultStoreError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup(&self, project: &ProjectKey) -> Result<(), ResultStoreError> {
        if self.retention.is_disabled() {
            return Ok(());
        }
        let secrets = self.list_secrets(ResultKind::Command, Some(project)).await?;
        let summaries = Self::summaries_from(&secrets, Some(project));
        for id in select_for_cleanup(&summaries, &self.retention, Utc::now()) {
            debug!("Retention removes command result {}", id);
            self.delete_secret(&ResultKind::Command.secret_name(&id)).await?;
        }
        Ok(())
    }
}

/// What a watch consumer has been told so far, keyed by result id.
///
/// `kube_runtime::watcher` re-lists after the server expired its position
/// (410 Gone) or the connection broke. A re-list is compared against this
/// state so the consumer only sees real changes: no repeated creates for
/// results it already knows, and deletes for results that vanished while the
/// watch was down.
#[derive(Debug, Default)]
struct WatchState {
    filter: Option<ProjectKey>,
    /// id -> (resourceVersion, summary)
    known: HashMap<String, (Option<String>, CommandResultSummary)>,
    relist: Option<Vec<Secret>>,
}

impl WatchState {
    fn new(filter: Option<ProjectKey>) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    fn decode(&self, secret: &Secret) -> Option<(Option<String>, CommandResultSummary)> {
        let summary: CommandResultSummary = match decode_summary(secret) {
            Ok(s) => s,
            Err(e) => {
                warn!("Skipping unreadable result secret in watch: {}", e);
                return None;
            }
        };
        filter_summary(&summary, self.filter.as_ref())
            .then(|| (secret.metadata.resource_version.clone(), summary))
    }

    /// Summary events to deliver for one watcher event
    fn apply(&mut self, event: watcher::Event<Secret>) -> Vec<WatchCommandResultSummaryEvent> {
        match event {
            watcher::Event::Init => {
                self.relist = Some(Vec::new());
                Vec::new()
            }
            watcher::Event::InitApply(secret) => {
                if let Some(pending) = self.relist.as_mut() {
                    pending.push(secret);
                    return Vec::new();
                }
                self.upsert(&secret).into_iter().collect()
            }
            watcher::Event::InitDone => self.finish_relist(),
            watcher::Event::Apply(secret) => self.upsert(&secret).into_iter().collect(),
            watcher::Event::Delete(secret) => {
                let Some((_, summary)) = self.decode(&secret) else {
                    return Vec::new();
                };
                match self.known.remove(&summary.id) {
                    Some(_) => vec![WatchCommandResultSummaryEvent { summary, delete: true }],
                    None => Vec::new(),
                }
            }
        }
    }

    fn upsert(&mut self, secret: &Secret) -> Option<WatchCommandResultSummaryEvent> {
        let (rv, summary) = self.decode(secret)?;
        if let Some((known_rv, _)) = self.known.get(&summary.id) {
            if rv.is_some() && *known_rv == rv {
                return None;
            }
        }
        self.known.insert(summary.id.clone(), (rv, summary.clone()));
        Some(WatchCommandResultSummaryEvent { summary, delete: false })
    }

    fn finish_relist(&mut self) -> Vec<WatchCommandResultSummaryEvent> {
        let listed = self.relist.take().unwrap_or_default();
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for secret in &listed {
            if let Some(ev) = self.upsert(secret) {
                events.push(ev);
            }
            if let Some((_, summary)) = self.decode(secret) {
                seen.insert(summary.id);
            }
        }
        let gone: Vec<String> = self.known.keys().filter(|id| !seen.contains(*id)).cloned().collect();
        for id in gone {
            if let Some((_, summary)) = self.known.remove(&id) {
                events.push(WatchCommandResultSummaryEvent { summary, delete: true });
            }
        }
        events
    }
}

#[async_trait]
impl ResultStore for SecretResultStore {
    async fn write_command_result(&self, cr: &CommandResult) -> Result<(), ResultStoreError> {
        if cr.id.is_empty() {
            return Err(ResultStoreError::Invalid("command result without id".to_string()));
        }
        let summary = cr.build_summary();
        let reduced = cr.to_reduced();
        self.apply_secret(
            ResultKind::Command,
            &cr.id,
            &cr.project_key,
            &cr.target_key,
            &summary,
            cr,
            Some(&reduced),
        )
        .await?;
        self.cleanup(&cr.project_key).await
    }

    async fn list_command_result_summaries(
        &self,
        options: &ListCommandResultSummariesOptions,
    ) -> Result<Vec<CommandResultSummary>, ResultStoreError> {
        let filter = options.project_filter.as_ref();
        let secrets = self.list_secrets(ResultKind::Command, filter).await?;
        Ok(Self::summaries_from(&secrets, filter))
    }

    async fn watch_command_result_summaries(
        &self,
        options: &ListCommandResultSummariesOptions,
        cancel: CancellationToken,
    ) -> Result<CommandResultSummaryWatch, ResultStoreError> {
        let filter = options.project_filter.clone();
        let config = watcher::Config::default().labels(&selector(ResultKind::Command, filter.as_ref())?);
        let mut stream = watcher(self.api.clone(), config).default_backoff().boxed();
        let mut state = WatchState::new(filter);

        // The watcher's initial list is the snapshot; everything after it is
        // a live event.
        let mut snapshot = loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    return Err(ResultStoreError::Watch("cancelled before the initial list completed".to_string()));
                }
                next = stream.try_next() => next,
            };
            match next {
                Ok(Some(watcher::Event::InitDone)) => {
                    break state.apply(watcher::Event::InitDone).into_iter().map(|e| e.summary).collect::<Vec<_>>();
                }
                Ok(Some(event)) => {
                    state.apply(event);
                }
                Ok(None) => {
                    return Err(ResultStoreError::Watch("watch ended before the initial list completed".to_string()));
                }
                Err(e) => return Err(ResultStoreError::Watch(e.to_string())),
            }
        };
        sort_summaries(&mut snapshot);

        let (tx, rx) = mpsc::unbounded_channel();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = task_cancel.cancelled() => return,
                    () = tx.closed() => return,
                    next = stream.try_next() => next,
                };
                match next {
                    Ok(Some(event)) => {
                        for ev in state.apply(event) {
                            if tx.send(Ok(ev)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("Result secret watch ended");
                        let _ = tx.send(Err(ResultStoreError::Watch("result secret watch ended".to_string())));
                        return;
                    }
                    // the watcher retries with backoff, the consumer still learns about the gap
                    Err(e) => {
                        warn!("Result secret watch failed, retrying: {}", e);
                        if tx.send(Err(ResultStoreError::Watch(e.to_string()))).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let events = UnboundedReceiverStream::new(rx)
            .take_until(cancel.cancelled_owned())
            .boxed();
        Ok(CommandResultSummaryWatch { snapshot, events })
    }

    async fn has_command_result(&self, id: &str) -> Result<bool, ResultStoreError> {
        Ok(self.get_secret(ResultKind::Command, id).await?.is_some())
    }

    async fn get_command_result_summary(
        &self,
        id: &str,
    ) -> Result<Option<CommandResultSummary>, ResultStoreError> {
        match self.get_secret(ResultKind::Command, id).await? {
            Some(s) => Ok(Some(decode_summary(&s)?)),
            None => Ok(None),
        }
    }

    async fn get_command_result(
        &self,
        options: &GetCommandResultOptions,
    ) -> Result<Option<CommandResult>, ResultStoreError> {
        let Some(secret) = self.get_secret(ResultKind::Command, &options.id).await? else {
            return Ok(None);
        };
        let key = if options.reduced { DATA_REDUCED_RESULT } else { DATA_RESULT };
        Ok(Some(decode_data(&secret, key)?))
    }

    async fn write_validate_result(&self, vr: &ValidateResult) -> Result<(), ResultStoreError> {
        if vr.id.is_empty() {
            return Err(ResultStoreError::Invalid("validate result without id".to_string()));
        }
        let summary = vr.build_summary();
        self.apply_secret::<_, (), _>(
            ResultKind::Validate,
            &vr.id,
            &vr.project_key,
            &vr.target_key,
            &summary,
            vr,
            None,
        )
        .await
    }

    async fn list_validate_result_summaries(
        &self,
        options: &ListCommandResultSummariesOptions,
    ) -> Result<Vec<ValidateResultSummary>, ResultStoreError> {
        let filter = options.project_filter.as_ref();
        let secrets = self.list_secrets(ResultKind::Validate, filter).await?;
        let mut ret: Vec<ValidateResultSummary> = secrets
            .iter()
            .filter_map(|s| decode_summary::<ValidateResultSummary>(s).ok())
            .filter(|s| filter_project(&s.project_key, filter))
            .collect();
        ret.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| b.end_time.cmp(&a.end_time)));
        Ok(ret)
    }

    async fn get_validate_result(&self, id: &str) -> Result<Option<ValidateResult>, ResultStoreError> {
        match self.get_secret(ResultKind::Validate, id).await? {
            Some(s) => Ok(Some(decode_data(&s, DATA_RESULT)?)),
            None => Ok(None),
        }
    }

    async fn write_drift_detection_result(
        &self,
        dr: &DriftDetectionResult,
    ) -> Result<(), ResultStoreError> {
        if dr.id.is_empty() {
            return Err(ResultStoreError::Invalid("drift detection result without id".to_string()));
        }
        let summary = dr.build_summary();
        self.apply_secret::<_, (), _>(
            ResultKind::Drift,
            &dr.id,
            &dr.project_key,
            &dr.target_key,
            &summary,
            dr,
            None,
        )
        .await
    }

    async fn get_drift_detection_result(
        &self,
        id: &str,
    ) -> Result<Option<DriftDetectionResult>, ResultStoreError> {
        match self.get_secret(ResultKind::Drift, id).await? {
            Some(s) => Ok(Some(decode_data(&s, DATA_RESULT)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RepoKey;

    fn secret_with_summary(summary: &CommandResultSummary, rv: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(format!("cr-{}", summary.id)),
                resource_version: Some(rv.into()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_SUMMARY.to_string(),
                    serde_json::to_string(summary).unwrap(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn summary(id: &str, project: &ProjectKey) -> CommandResultSummary {
        CommandResultSummary {
            id: id.into(),
            project_key: project.clone(),
            ..Default::default()
        }
    }

    fn project(repo: &str) -> ProjectKey {
        ProjectKey::new(RepoKey::parse_git_url(&format!("https://example.com/{}", repo)).unwrap(), "")
    }

    fn ids(events: &[WatchCommandResultSummaryEvent]) -> Vec<(String, bool)> {
        events.iter().map(|e| (e.summary.id.clone(), e.delete)).collect()
    }

    /// Initial list of `secrets`, as the watcher delivers it
    fn initial_list(state: &mut WatchState, secrets: Vec<Secret>) -> Vec<WatchCommandResultSummaryEvent> {
        assert!(state.apply(watcher::Event::Init).is_empty());
        for s in secrets {
            assert!(state.apply(watcher::Event::InitApply(s)).is_empty());
        }
        state.apply(watcher::Event::InitDone)
    }

    #[test]
    fn test_secret_names() {
        assert_eq!(ResultKind::Command.secret_name("abc"), "cr-abc");
        assert_eq!(ResultKind::Validate.secret_name("abc"), "vr-abc");
        assert_eq!(ResultKind::Drift.secret_name("abc"), "dr-abc");
    }

    #[test]
    fn test_identity_hash_is_label_safe_and_stable() {
        let p = ProjectKey::new(RepoKey::parse_git_url("https://example.com/a/b").unwrap(), "sub");
        let h1 = identity_hash(&p).unwrap();
        let h2 = identity_hash(&p.clone()).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_selector() {
        assert_eq!(
            selector(ResultKind::Command, None).unwrap(),
            "kluctl.io/result-kind=CommandResult"
        );
        let p = ProjectKey::new(RepoKey::parse_git_url("https://example.com/a/b").unwrap(), "");
        let s = selector(ResultKind::Command, Some(&p)).unwrap();
        assert!(s.starts_with("kluctl.io/result-kind=CommandResult,kluctl.io/result-project-hash="));
    }

    #[test]
    fn test_watch_state_filters_and_deduplicates() {
        let p = project("a/b");
        let other = project("x/y");
        let mut state = WatchState::new(Some(p.clone()));

        let snapshot = initial_list(
            &mut state,
            vec![secret_with_summary(&summary("1", &p), "10"), secret_with_summary(&summary("x", &other), "11")],
        );
        assert_eq!(ids(&snapshot), vec![("1".to_string(), false)]);

        // same version again is not news, a new version is
        assert!(state.apply(watcher::Event::Apply(secret_with_summary(&summary("1", &p), "10"))).is_empty());
        let ev = state.apply(watcher::Event::Apply(secret_with_summary(&summary("1", &p), "12")));
        assert_eq!(ids(&ev), vec![("1".to_string(), false)]);

        assert!(state.apply(watcher::Event::Apply(secret_with_summary(&summary("y", &other), "13"))).is_empty());

        let ev = state.apply(watcher::Event::Delete(secret_with_summary(&summary("1", &p), "14")));
        assert_eq!(ids(&ev), vec![("1".to_string(), true)]);
        assert!(state.apply(watcher::Event::Delete(secret_with_summary(&summary("1", &p), "14"))).is_empty());
    }

    #[test]
    fn test_watch_state_relist_after_expired_watch() {
        let p = project("a/b");
        let mut state = WatchState::new(None);
        initial_list(
            &mut state,
            vec![
                secret_with_summary(&summary("kept", &p), "1"),
                secret_with_summary(&summary("changed", &p), "2"),
                secret_with_summary(&summary("removed", &p), "3"),
            ],
        );

        // the watch expired, the watcher lists again
        let events = initial_list(
            &mut state,
            vec![
                secret_with_summary(&summary("kept", &p), "1"),
                secret_with_summary(&summary("changed", &p), "7"),
                secret_with_summary(&summary("added", &p), "8"),
            ],
        );
        let mut got = ids(&events);
        got.sort();
        assert_eq!(
            got,
            vec![
                ("added".to_string(), false),
                ("changed".to_string(), false),
                ("removed".to_string(), true),
            ]
        );
    }
}
