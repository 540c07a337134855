//! Cycle planning
//!
//! Pure decisions over the resource and its last status: whether a cycle has
//! to run now, which manual requests it handles, whether it deploys, and when
//! the next cycle is due. Nothing here talks to a cluster or a pipeline.

use chrono::{DateTime, Utc};
use crds::{
    pending_request, ConditionStatus, DecodeError, InvalidSpec, KluctlDeployment, KluctlDeploymentSpec,
    KluctlDeploymentStatus, ManualRequest, PendingRequest, RequestKind, reasons,
};
use std::time::Duration;

/// Shortest delay ever returned for a requeue
pub const MIN_REQUEUE: Duration = Duration::from_secs(1);

/// Why a cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Nothing was reconciled yet
    FirstRun,
    /// The spec was edited since the last cycle
    GenerationChanged,
    /// The reconcile (or retry) interval elapsed
    IntervalElapsed,
    /// The forced deploy interval elapsed
    DeployIntervalElapsed,
    /// The validate interval elapsed
    ValidateIntervalElapsed,
    /// A new token arrived on a request channel
    ManualRequest(RequestKind),
}

/// Outcome of planning one reconcile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CyclePlan {
    pub triggers: Vec<Trigger>,
    /// New requests, in channel order
    pub requests: Vec<(RequestKind, ManualRequest)>,
    /// Annotation values that do not decode, with the raw value as token
    pub invalid_requests: Vec<(RequestKind, String, DecodeError)>,
}

impl CyclePlan {
    /// True when the pipeline has to run
    pub fn should_run(&self) -> bool {
        !self.triggers.is_empty()
    }

    pub fn has_trigger(&self, trigger: Trigger) -> bool {
        self.triggers.contains(&trigger)
    }

    /// The new request of a channel
    pub fn request(&self, kind: RequestKind) -> Option<&ManualRequest> {
        self.requests.iter().find(|(k, _)| *k == kind).map(|(_, r)| r)
    }

    /// Overrides of the first request that carries any
    pub fn overrides_patch(&self) -> Option<&serde_json::Value> {
        self.requests.iter().find_map(|(_, r)| r.overrides_patch.as_ref())
    }
}

/// What to do about the deploy step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployDecision {
    /// Nothing changed, nothing asked for
    Skip,
    /// Run the deploy command
    Deploy { dry_run: bool },
    /// Manual deployment whose rendered objects are not approved: simulate only
    AwaitApproval,
}

/// True when `interval` passed since `since`; never true without a start
fn elapsed(since: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> bool {
    match (since, chrono::Duration::from_std(interval)) {
        (Some(t), Ok(i)) => now >= t + i,
        _ => false,
    }
}

/// True when the last cycle ended in failure, so the retry interval applies
pub fn last_cycle_failed(status: &KluctlDeploymentStatus) -> bool {
    status.ready_condition().is_some_and(|c| c.status == ConditionStatus::False && c.reason != reasons::SUSPENDED)
}

/// Interval until the next regular cycle
pub fn reconcile_interval(spec: &KluctlDeploymentSpec, status: &KluctlDeploymentStatus) -> Result<Duration, InvalidSpec> {
    if last_cycle_failed(status) {
        spec.retry_interval()
    } else {
        spec.interval()
    }
}

/// Validate interval, `None` when validation is off
fn validate_interval(spec: &KluctlDeploymentSpec) -> Result<Option<Duration>, InvalidSpec> {
    if spec.validate { spec.validate_interval() } else { Ok(None) }
}

/// Start of the last real (or dry-run) deploy
fn last_deploy_time(status: &KluctlDeploymentStatus) -> Option<DateTime<Utc>> {
    status.last_deploy_result.as_ref().map(|s| s.command_info.start_time)
}

/// Decides whether and why a cycle runs
pub fn plan_cycle(obj: &KluctlDeployment, now: DateTime<Utc>) -> Result<CyclePlan, InvalidSpec> {
    let spec = &obj.spec;
    let default_status = KluctlDeploymentStatus::default();
    let status = obj.status.as_ref().unwrap_or(&default_status);
    let mut plan = CyclePlan::default();

    let annotations = obj.metadata.annotations.as_ref();
    for kind in RequestKind::ALL {
        match pending_request(kind, annotations, status.request_result(kind)) {
            PendingRequest::None => {}
            PendingRequest::New(request) => {
                // With abortOnError a new token waits for the next regular cycle
                if !spec.abort_on_error {
                    plan.triggers.push(Trigger::ManualRequest(kind));
                }
                plan.requests.push((kind, request));
            }
            PendingRequest::Invalid { raw, error } => plan.invalid_requests.push((kind, raw, error)),
        }
    }

    if status.last_reconcile_time.is_none() {
        plan.triggers.push(Trigger::FirstRun);
    } else if obj.metadata.generation.unwrap_or_default() != status.observed_generation {
        plan.triggers.push(Trigger::GenerationChanged);
    }

    if elapsed(status.last_reconcile_time, reconcile_interval(spec, status)?, now) {
        plan.triggers.push(Trigger::IntervalElapsed);
    }

    if let Some(deploy_interval) = spec.deploy_interval()? {
        if elapsed(last_deploy_time(status), deploy_interval, now) {
            plan.triggers.push(Trigger::DeployIntervalElapsed);
        }
    }

    if let Some(validate_interval) = validate_interval(spec)? {
        if elapsed(status.last_validate_time, validate_interval, now) {
            plan.triggers.push(Trigger::ValidateIntervalElapsed);
        }
    }

    Ok(plan)
}

/// Deploy step of a cycle that rendered objects with `objects_hash`
pub fn decide_deploy(
    spec: &KluctlDeploymentSpec,
    status: &KluctlDeploymentStatus,
    plan: &CyclePlan,
    objects_hash: &str,
) -> DeployDecision {
    let last_deploy_failed = status.last_deploy_result.as_ref().is_some_and(|s| s.errors > 0);
    let wanted = plan.request(RequestKind::Deploy).is_some()
        || plan.has_trigger(Trigger::FirstRun)
        || plan.has_trigger(Trigger::GenerationChanged)
        || plan.has_trigger(Trigger::DeployIntervalElapsed)
        || status.last_deploy_result.is_none()
        || last_deploy_failed
        || status.last_objects_hash != objects_hash;

    if !wanted {
        return DeployDecision::Skip;
    }
    if spec.manual && spec.manual_objects_hash.as_deref() != Some(objects_hash) {
        return DeployDecision::AwaitApproval;
    }
    DeployDecision::Deploy { dry_run: spec.dry_run }
}

/// Delay until the earliest pending deadline, at least [`MIN_REQUEUE`]
pub fn next_requeue(
    spec: &KluctlDeploymentSpec,
    status: &KluctlDeploymentStatus,
    now: DateTime<Utc>,
) -> Result<Duration, InvalidSpec> {
    let mut deadlines = Vec::new();
    let mut push = |since: Option<DateTime<Utc>>, interval: Duration| {
        if let (Some(t), Ok(i)) = (since, chrono::Duration::from_std(interval)) {
            deadlines.push(t + i);
        }
    };

    push(status.last_reconcile_time, reconcile_interval(spec, status)?);
    if let Some(deploy_interval) = spec.deploy_interval()? {
        push(last_deploy_time(status), deploy_interval);
    }
    if let Some(validate_interval) = validate_interval(spec)? {
        push(status.last_validate_time, validate_interval);
    }

    let Some(next) = deadlines.into_iter().min() else {
        return Ok(MIN_REQUEUE);
    };
    let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
    Ok(delay.max(MIN_REQUEUE))
}

#[cfg(test)]
#[path = "plan_test.rs"]
mod plan_test;
