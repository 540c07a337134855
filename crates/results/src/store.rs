//! Result store contract
//!
//! The [`ResultStore`] trait is the persistence seam between the reconciler
//! (writer) and CLI/UI consumers (readers). Ordering, filtering and retention
//! selection are plain functions here so every backend applies them
//! identically.

use crate::command_result::{CommandResult, CommandResultSummary};
use crate::drift_result::DriftDetectionResult;
use crate::error::ResultStoreError;
use crate::keys::{ProjectKey, TargetKey};
use crate::validate_result::{ValidateResult, ValidateResultSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Options for listing and watching summaries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCommandResultSummariesOptions {
    /// Only summaries of this project; `None` matches everything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_filter: Option<ProjectKey>,
}

impl ListCommandResultSummariesOptions {
    /// Options matching only `project`
    pub fn for_project(project: ProjectKey) -> Self {
        Self {
            project_filter: Some(project),
        }
    }
}

/// Options for a point lookup of a full command result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCommandResultOptions {
    pub id: String,
    /// Omit rendered/remote/applied payloads and diffs
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reduced: bool,
}

/// One change observed by a summary watch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchCommandResultSummaryEvent {
    pub summary: CommandResultSummary,
    pub delete: bool,
}

/// A project together with one of its targets
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectTargetKey {
    pub project: ProjectKey,
    pub target: TargetKey,
}

/// Snapshot plus live updates, as returned by
/// [`ResultStore::watch_command_result_summaries`].
///
/// Every summary in `snapshot` was present when the watch was established;
/// `events` only carries changes made afterwards. Dropping `events` or
/// cancelling the token passed to the watch releases the subscription.
///
/// A backend that loses its subscription yields an `Err` item rather than
/// ending the stream silently. The stream only ends after cancellation or an
/// error it cannot recover from.
pub struct CommandResultSummaryWatch {
    pub snapshot: Vec<CommandResultSummary>,
    pub events: BoxStream<'static, Result<WatchCommandResultSummaryEvent, ResultStoreError>>,
}

impl std::fmt::Debug for CommandResultSummaryWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandResultSummaryWatch")
            .field("snapshot", &self.snapshot.len())
            .finish_non_exhaustive()
    }
}

/// Persistence of command, validate and drift detection results.
///
/// Writes of different ids may run concurrently. Writing an id twice replaces
/// the earlier record completely; readers see either the old or the new
/// record, never a mix.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persists a full command result keyed by its id
    async fn write_command_result(&self, cr: &CommandResult) -> Result<(), ResultStoreError>;

    /// Summaries matching the filter, most recent first
    async fn list_command_result_summaries(
        &self,
        options: &ListCommandResultSummariesOptions,
    ) -> Result<Vec<CommandResultSummary>, ResultStoreError>;

    /// Matching snapshot plus a stream of subsequent writes and deletions
    async fn watch_command_result_summaries(
        &self,
        options: &ListCommandResultSummariesOptions,
        cancel: CancellationToken,
    ) -> Result<CommandResultSummaryWatch, ResultStoreError>;

    async fn has_command_result(&self, id: &str) -> Result<bool, ResultStoreError>;

    async fn get_command_result_summary(
        &self,
        id: &str,
    ) -> Result<Option<CommandResultSummary>, ResultStoreError>;

    async fn get_command_result(
        &self,
        options: &GetCommandResultOptions,
    ) -> Result<Option<CommandResult>, ResultStoreError>;

    async fn write_validate_result(&self, vr: &ValidateResult) -> Result<(), ResultStoreError>;

    async fn list_validate_result_summaries(
        &self,
        options: &ListCommandResultSummariesOptions,
    ) -> Result<Vec<ValidateResultSummary>, ResultStoreError>;

    async fn get_validate_result(&self, id: &str) -> Result<Option<ValidateResult>, ResultStoreError>;

    async fn write_drift_detection_result(
        &self,
        dr: &DriftDetectionResult,
    ) -> Result<(), ResultStoreError>;

    async fn get_drift_detection_result(
        &self,
        id: &str,
    ) -> Result<Option<DriftDetectionResult>, ResultStoreError>;

    /// Distinct projects that have at least one command result
    async fn list_projects(
        &self,
        options: &ListCommandResultSummariesOptions,
    ) -> Result<Vec<ProjectKey>, ResultStoreError> {
        let summaries = self.list_command_result_summaries(options).await?;
        let projects: BTreeSet<ProjectKey> = summaries.into_iter().map(|s| s.project_key).collect();
        Ok(projects.into_iter().collect())
    }

    /// Distinct project/target pairs that have at least one command result
    async fn list_targets(
        &self,
        options: &ListCommandResultSummariesOptions,
    ) -> Result<Vec<ProjectTargetKey>, ResultStoreError> {
        let summaries = self.list_command_result_summaries(options).await?;
        let targets: BTreeSet<ProjectTargetKey> = summaries
            .into_iter()
            .map(|s| ProjectTargetKey {
                project: s.project_key,
                target: s.target_key,
            })
            .collect();
        Ok(targets.into_iter().collect())
    }
}

/// Returns true when `summary` belongs to the project in `filter`.
///
/// Repository key and sub-directory must both match exactly. `None` matches
/// everything. List and watch share this predicate.
pub fn filter_summary(summary: &CommandResultSummary, filter: Option<&ProjectKey>) -> bool {
    filter_project(&summary.project_key, filter)
}

pub(crate) fn filter_project(project_key: &ProjectKey, filter: Option<&ProjectKey>) -> bool {
    match filter {
        None => true,
        Some(f) => project_key.repo_key == f.repo_key && project_key.sub_dir == f.sub_dir,
    }
}

/// Most-recent-first order: start time descending, then end time descending,
/// then command name ascending.
pub fn compare_summaries(a: &CommandResultSummary, b: &CommandResultSummary) -> Ordering {
    b.command_info
        .start_time
        .cmp(&a.command_info.start_time)
        .then_with(|| b.command_info.end_time.cmp(&a.command_info.end_time))
        .then_with(|| a.command_info.command.cmp(&b.command_info.command))
}

/// Sorts summaries in place with [`compare_summaries`] (stable)
pub fn sort_summaries(summaries: &mut [CommandResultSummary]) {
    summaries.sort_by(compare_summaries);
}

/// Commands whose applied objects make up what a deployment owns on its
/// target
pub const APPLYING_COMMANDS: [&str; 2] = ["deploy", "poke-images"];

/// True for a real (not dry-run) deploy or poke-images result
pub fn is_applying(summary: &CommandResultSummary) -> bool {
    !summary.command_info.dry_run && APPLYING_COMMANDS.contains(&summary.command_info.command.as_str())
}

/// Retention rules applied after every write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Results kept per project/target pair, `0` keeps all
    pub keep_count: usize,
    /// Results older than this are dropped, `None` keeps all
    pub keep_age: Option<Duration>,
}

impl RetentionPolicy {
    pub fn new(keep_count: usize, keep_age: Option<Duration>) -> Self {
        Self { keep_count, keep_age }
    }

    pub fn is_disabled(&self) -> bool {
        self.keep_count == 0 && self.keep_age.is_none()
    }
}

/// Ids of command results that fall outside the retention policy.
///
/// The newest applying result of every project/target pair is always kept:
/// deleting a deployment reads the objects to remove from it.
pub fn select_for_cleanup(
    summaries: &[CommandResultSummary],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<String> {
    if policy.is_disabled() {
        return Vec::new();
    }

    let cutoff = policy
        .keep_age
        .and_then(|age| chrono::Duration::from_std(age).ok())
        .map(|age| now - age);

    let mut by_target: HashMap<(&ProjectKey, &TargetKey), Vec<&CommandResultSummary>> = HashMap::new();
    for s in summaries {
        by_target.entry((&s.project_key, &s.target_key)).or_default().push(s);
    }

    let mut ids = Vec::new();
    for group in by_target.values_mut() {
        group.sort_by(|a, b| compare_summaries(a, b));
        let last_applied = group.iter().position(|s| is_applying(s));
        for (i, s) in group.iter().enumerate() {
            if Some(i) == last_applied {
                continue;
            }
            let too_many = policy.keep_count != 0 && i >= policy.keep_count;
            let too_old = cutoff.is_some_and(|c| s.command_info.start_time < c);
            if too_many || too_old {
                ids.push(s.id.clone());
            }
        }
    }
    ids.sort();
    ids
}
