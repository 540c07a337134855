//! In-memory result store
//!
//! Keeps everything in process memory. Used by tests and by single-process
//! setups where results do not need to survive a restart.

use crate::command_result::{CommandResult, CommandResultSummary};
use crate::drift_result::DriftDetectionResult;
use crate::error::ResultStoreError;
use crate::keys::ProjectKey;
use crate::store::{
    filter_project, filter_summary, select_for_cleanup, sort_summaries, CommandResultSummaryWatch,
    GetCommandResultOptions, ListCommandResultSummariesOptions, ResultStore, RetentionPolicy,
    WatchCommandResultSummaryEvent,
};
use crate::validate_result::{ValidateResult, ValidateResultSummary};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct StoredCommandResult {
    result: CommandResult,
    summary: CommandResultSummary,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    filter: Option<ProjectKey>,
    tx: mpsc::UnboundedSender<WatchCommandResultSummaryEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    command_results: HashMap<String, StoredCommandResult>,
    validate_results: HashMap<String, ValidateResult>,
    drift_results: HashMap<String, DriftDetectionResult>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

impl Inner {
    fn notify(&mut self, summary: &CommandResultSummary, delete: bool) {
        // Closed receivers are dropped on the way.
        self.subscribers.retain(|sub| {
            if !filter_summary(summary, sub.filter.as_ref()) {
                return !sub.tx.is_closed();
            }
            sub.tx
                .send(WatchCommandResultSummaryEvent {
                    summary: summary.clone(),
                    delete,
                })
                .is_ok()
        });
    }

    fn apply_retention(&mut self, policy: &RetentionPolicy) {
        if policy.is_disabled() {
            return;
        }
        let summaries: Vec<CommandResultSummary> =
            self.command_results.values().map(|s| s.summary.clone()).collect();
        for id in select_for_cleanup(&summaries, policy, Utc::now()) {
            if let Some(removed) = self.command_results.remove(&id) {
                debug!("Retention removed command result {}", id);
                self.notify(&removed.summary, true);
            }
        }
    }
}

/// Result store backed by process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryResultStore {
    inner: Arc<RwLock<Inner>>,
    retention: RetentionPolicy,
}

impl MemoryResultStore {
    /// Creates an empty store without retention
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store applying `retention` after every write
    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            inner: Arc::default(),
            retention,
        }
    }

    /// Number of active watch subscriptions
    pub async fn subscriber_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.subscribers.iter().filter(|s| !s.tx.is_closed()).count()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn write_command_result(&self, cr: &CommandResult) -> Result<(), ResultStoreError> {
        if cr.id.is_empty() {
            return Err(ResultStoreError::Invalid("command result without id".to_string()));
        }
        let summary = cr.build_summary();

        let mut inner = self.inner.write().await;
        inner.command_results.insert(
            cr.id.clone(),
            StoredCommandResult {
                result: cr.clone(),
                summary: summary.clone(),
            },
        );
        inner.notify(&summary, false);
        inner.apply_retention(&self.retention);
        Ok(())
    }

    async fn list_command_result_summaries(
        &self,
        options: &ListCommandResultSummariesOptions,
    ) -> Result<Vec<CommandResultSummary>, ResultStoreError> {
        let inner = self.inner.read().await;
        let mut ret: Vec<CommandResultSummary> = inner
            .command_results
            .values()
            .filter(|s| filter_summary(&s.summary, options.project_filter.as_ref()))
            .map(|s| s.summary.clone())
            .collect();
        sort_summaries(&mut ret);
        Ok(ret)
    }

    async fn watch_command_result_summaries(
        &self,
        options: &ListCommandResultSummariesOptions,
        cancel: CancellationToken,
    ) -> Result<CommandResultSummaryWatch, ResultStoreError> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Snapshot and registration happen under the same write lock, so no
        // write can fall between them.
        let (snapshot, subscriber_id) = {
            let mut inner = self.inner.write().await;
            let mut snapshot: Vec<CommandResultSummary> = inner
                .command_results
                .values()
                .filter(|s| filter_summary(&s.summary, options.project_filter.as_ref()))
                .map(|s| s.summary.clone())
                .collect();
            sort_summaries(&mut snapshot);

            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.push(Subscriber {
                id,
                filter: options.project_filter.clone(),
                tx: tx.clone(),
            });
            (snapshot, id)
        };

        let inner = Arc::clone(&self.inner);
        let unsubscribe = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = unsubscribe.cancelled() => {}
                () = tx.closed() => {}
            }
            inner.write().await.subscribers.retain(|s| s.id != subscriber_id);
            debug!("Watch subscriber {} released", subscriber_id);
        });

        let events = UnboundedReceiverStream::new(rx)
            .map(Ok)
            .take_until(cancel.cancelled_owned())
            .boxed();

        Ok(CommandResultSummaryWatch { snapshot, events })
    }

    async fn has_command_result(&self, id: &str) -> Result<bool, ResultStoreError> {
        Ok(self.inner.read().await.command_results.contains_key(id))
    }

    async fn get_command_result_summary(
        &self,
        id: &str,
    ) -> Result<Option<CommandResultSummary>, ResultStoreError> {
        let inner = self.inner.read().await;
        Ok(inner.command_results.get(id).map(|s| s.summary.clone()))
    }

    async fn get_command_result(
        &self,
        options: &GetCommandResultOptions,
    ) -> Result<Option<CommandResult>, ResultStoreError> {
        let inner = self.inner.read().await;
        Ok(inner.command_results.get(&options.id).map(|s| {
            if options.reduced {
                s.result.to_reduced()
            } else {
                s.result.clone()
            }
        }))
    }

    async fn write_validate_result(&self, vr: &ValidateResult) -> Result<(), ResultStoreError> {
        if vr.id.is_empty() {
            return Err(ResultStoreError::Invalid("validate result without id".to_string()));
        }
        let mut inner = self.inner.write().await;
        inner.validate_results.insert(vr.id.clone(), vr.clone());
        Ok(())
    }

    async fn list_validate_result_summaries(
        &self,
        options: &ListCommandResultSummariesOptions,
    ) -> Result<Vec<ValidateResultSummary>, ResultStoreError> {
        let inner = self.inner.read().await;
        let mut ret: Vec<ValidateResultSummary> = inner
            .validate_results
            .values()
            .filter(|vr| filter_project(&vr.project_key, options.project_filter.as_ref()))
            .map(ValidateResult::build_summary)
            .collect();
        ret.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| b.end_time.cmp(&a.end_time)));
        Ok(ret)
    }

    async fn get_validate_result(&self, id: &str) -> Result<Option<ValidateResult>, ResultStoreError> {
        Ok(self.inner.read().await.validate_results.get(id).cloned())
    }

    async fn write_drift_detection_result(
        &self,
        dr: &DriftDetectionResult,
    ) -> Result<(), ResultStoreError> {
        if dr.id.is_empty() {
            return Err(ResultStoreError::Invalid("drift detection result without id".to_string()));
        }
        let mut inner = self.inner.write().await;
        inner.drift_results.insert(dr.id.clone(), dr.clone());
        Ok(())
    }

    async fn get_drift_detection_result(
        &self,
        id: &str,
    ) -> Result<Option<DriftDetectionResult>, ResultStoreError> {
        Ok(self.inner.read().await.drift_results.get(id).cloned())
    }
}
