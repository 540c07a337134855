//! One reconcile cycle of a KluctlDeployment.
//!
//! A cycle renders the project once and then runs, in this order: the diff
//! request, the deploy step (including the manual approval gate), prune,
//! validate and drift detection. Every command result is written to the
//! result store before the new status is handed back to the caller, which
//! patches it onto the resource.
//!
//! The whole pipeline part is bounded by `spec.timeout`. Pipeline
//! failures never escape: they become status conditions and errored results.
//! Result store failures do escape and are retried by the caller.

use crate::error::ControllerError;
use crate::in_flight::InFlight;
use crate::pipeline::{
    DeploymentPipeline, DriftOutput, PipelineCommand, PipelineContext, RenderOutput, ValidateOutput,
};
use crate::reconcile_helpers::{apply_overrides, objects_hash, CommandRun};
use crate::reconciler::plan::{decide_deploy, next_requeue, plan_cycle, CyclePlan, DeployDecision, Trigger, MIN_REQUEUE};
use chrono::{DateTime, Utc};
use crds::{
    format_duration, record_handled, reasons, set_condition, Condition, ConditionStatus, DeployMode,
    KluctlDeployment, KluctlDeploymentStatus, ManualRequest, RequestKind,
};
use results::{CommandResult, DeploymentError, KluctlDeploymentInfo, ResultStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Requeue used when a cycle for the same resource is still running
pub const BUSY_REQUEUE: Duration = Duration::from_secs(5);

/// Inputs of one cycle that come from outside the resource
#[derive(Debug, Clone)]
pub struct CycleInput<'a> {
    pub obj: &'a KluctlDeployment,
    /// Key of the target cluster accessor
    pub cluster: String,
    /// Identity of the target cluster, once known
    pub cluster_id: Option<String>,
    /// User to impersonate on the target cluster
    pub impersonate: Option<String>,
    pub now: DateTime<Utc>,
}

/// Result of a cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleResult {
    /// Status to patch onto the resource
    pub status: KluctlDeploymentStatus,
    pub requeue_after: Duration,
    /// False when the cycle was skipped or had nothing to do
    pub ran_pipeline: bool,
}

/// Outcome of one step, recorded for the requests that asked for it
#[derive(Debug, Clone, Default)]
struct StepOutcome {
    result_id: Option<String>,
    error: Option<String>,
}

/// Collects what happened during the pipeline part of a cycle
#[derive(Debug, Default)]
struct Execution {
    steps: BTreeMap<RequestKind, StepOutcome>,
    /// First failure as (reason, message)
    failure: Option<(&'static str, String)>,
    /// Hash waiting for manual approval
    awaiting_approval: Option<String>,
    /// Id of the deploy (or dry-run deploy) result of the cycle
    main_result_id: Option<String>,
}

impl Execution {
    fn fail(&mut self, reason: &'static str, message: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some((reason, message.into()));
        }
    }

    fn step(&mut self, kind: RequestKind, result_id: Option<String>, error: Option<String>) {
        self.steps.insert(kind, StepOutcome { result_id, error });
    }
}

/// Wall clock of a cycle: starts at the cycle's `now` and advances in real time
#[derive(Debug, Clone, Copy)]
struct CycleClock {
    start: DateTime<Utc>,
    started: Instant,
}

impl CycleClock {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::from_std(self.started.elapsed()).unwrap_or_default()
    }
}

/// Runs cycles against a pipeline and a result store
#[derive(Clone)]
pub struct DeploymentRunner {
    store: Arc<dyn ResultStore>,
    pipeline: Arc<dyn DeploymentPipeline>,
    in_flight: InFlight,
}

impl std::fmt::Debug for DeploymentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentRunner").field("in_flight", &self.in_flight).finish_non_exhaustive()
    }
}

/// Error summary of a command result, `None` when it has no errors
fn result_error(cr: &CommandResult) -> Option<String> {
    if cr.errors.is_empty() {
        return None;
    }
    Some(cr.errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join("; "))
}

impl DeploymentRunner {
    pub fn new(store: Arc<dyn ResultStore>, pipeline: Arc<dyn DeploymentPipeline>) -> Self {
        Self {
            store,
            pipeline,
            in_flight: InFlight::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Single-flight registry shared by cycles and cleanup
    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Plans and, when due, executes one cycle.
    ///
    /// The spec must have passed `validate_spec` already.
    pub async fn run_cycle(&self, input: CycleInput<'_>) -> Result<CycleResult, ControllerError> {
        let obj = input.obj;
        let key = obj.key();
        let mut status = obj.status.clone().unwrap_or_default();

        let Some(_guard) = self.in_flight.try_acquire(&key) else {
            debug!("Cycle for {} already running, coalescing", key);
            return Ok(CycleResult {
                status,
                requeue_after: BUSY_REQUEUE,
                ran_pipeline: false,
            });
        };

        let plan = plan_cycle(obj, input.now)?;
        let generation = obj.metadata.generation;

        if !plan.invalid_requests.is_empty() {
            let mut messages = Vec::new();
            for (kind, raw, error) in &plan.invalid_requests {
                warn!("Invalid {} request on {}: {}", kind, key, error);
                let recorded = record_handled(
                    status.request_result(*kind),
                    ManualRequest::new(raw.clone()),
                    input.now,
                    input.now,
                    "",
                    None,
                    Some(error.to_string()),
                );
                status.set_request_result(*kind, recorded);
                messages.push(format!("{}: {}", kind.annotation(), error));
            }
            set_condition(
                &mut status.conditions,
                Condition::ready(
                    ConditionStatus::False,
                    reasons::MANUAL_REQUEST_INVALID,
                    messages.join("; "),
                    generation,
                    input.now,
                ),
            );
            // the remaining triggers run in the next cycle
            return Ok(CycleResult {
                status,
                requeue_after: MIN_REQUEUE,
                ran_pipeline: false,
            });
        }

        if !plan.should_run() {
            return Ok(CycleResult {
                requeue_after: next_requeue(&obj.spec, &status, input.now)?,
                status,
                ran_pipeline: false,
            });
        }

        info!("Reconciling {} (triggers: {:?})", key, plan.triggers);

        let reconcile_id = uuid::Uuid::new_v4().to_string();
        let project_key = obj.spec.project_key()?;
        let target_key = obj.spec.target_key(input.cluster_id.clone());
        status.project_key = Some(project_key.clone());
        status.target_key = Some(target_key.clone());
        status.last_reconcile_time = Some(input.now);
        status.observed_generation = generation.unwrap_or_default();

        let spec = match apply_overrides(&obj.spec, plan.overrides_patch()) {
            Ok(spec) => spec,
            Err(e) => {
                let message = format!("invalid overridesPatch: {}", e);
                warn!("{} on {}", message, key);
                record_requests(
                    &mut status,
                    &plan,
                    &Execution::default(),
                    Some(&message),
                    input.now,
                    input.now,
                    &reconcile_id,
                );
                set_condition(
                    &mut status.conditions,
                    Condition::ready(ConditionStatus::False, reasons::MANUAL_REQUEST_INVALID, message, generation, input.now),
                );
                return Ok(CycleResult {
                    requeue_after: next_requeue(&obj.spec, &status, input.now)?,
                    status,
                    ran_pipeline: false,
                });
            }
        };

        let timeout = spec.timeout()?;
        let ctx = PipelineContext {
            deployment: KluctlDeploymentInfo {
                name: obj.metadata.name.clone().unwrap_or_default(),
                namespace: obj.metadata.namespace.clone().unwrap_or_default(),
                generation: generation.unwrap_or_default(),
            },
            spec,
            project_key,
            target_key,
            reconcile_id: reconcile_id.clone(),
            overrides_patch: plan.overrides_patch().cloned(),
            cluster: input.cluster,
            impersonate: input.impersonate,
        };

        let clock = CycleClock::new(input.now);
        let mut execution = Execution::default();
        let outcome =
            tokio::time::timeout(timeout, self.execute(&ctx, &plan, &mut status, &mut execution, clock)).await;
        match outcome {
            Ok(res) => res?,
            Err(_) => {
                let message = format!("reconciliation did not finish within {}", format_duration(timeout));
                warn!("{} ({})", message, key);
                execution.fail(reasons::TIMEOUT, message);
            }
        }

        let failure_message = execution.failure.as_ref().map(|(_, m)| m.clone());
        record_requests(
            &mut status,
            &plan,
            &execution,
            failure_message.as_deref(),
            input.now,
            clock.now(),
            &reconcile_id,
        );

        let condition = match (&execution.failure, &execution.awaiting_approval) {
            (Some((reason, message)), _) => {
                Condition::ready(ConditionStatus::False, reason, message, generation, input.now)
            }
            (None, Some(hash)) => Condition::ready(
                ConditionStatus::Unknown,
                reasons::AWAITING_APPROVAL,
                format!("waiting for approval of rendered objects hash {}", hash),
                generation,
                input.now,
            ),
            (None, None) => Condition::ready(
                ConditionStatus::True,
                reasons::RECONCILIATION_SUCCEEDED,
                "reconciliation succeeded",
                generation,
                input.now,
            ),
        };
        set_condition(&mut status.conditions, condition);

        match &execution.failure {
            Some((reason, message)) => warn!("Reconciliation of {} failed ({}): {}", key, reason, message),
            None => info!("Reconciliation of {} finished", key),
        }

        Ok(CycleResult {
            requeue_after: next_requeue(&obj.spec, &status, input.now)?,
            status,
            ran_pipeline: true,
        })
    }

    /// Pipeline part of a cycle. Only result store errors are returned.
    async fn execute(
        &self,
        ctx: &PipelineContext,
        plan: &CyclePlan,
        status: &mut KluctlDeploymentStatus,
        execution: &mut Execution,
        clock: CycleClock,
    ) -> Result<(), ControllerError> {
        let spec = &ctx.spec;
        let deploy_command = match spec.deploy_mode()? {
            DeployMode::FullDeploy => PipelineCommand::Deploy,
            DeployMode::PokeImages => PipelineCommand::PokeImages,
        };

        let render_start = clock.now();
        let rendered = match self.pipeline.render(ctx).await {
            Ok(rendered) => rendered,
            Err(e) => {
                let message = format!("failed to render project: {}", e);
                warn!("{}/{}: {}", ctx.deployment.namespace, ctx.deployment.name, message);
                status.last_prepare_error.clone_from(&message);
                let run = CommandRun {
                    ctx,
                    command: deploy_command.as_str(),
                    dry_run: spec.dry_run,
                    start_time: render_start,
                    end_time: clock.now(),
                    rendered_objects_hash: None,
                };
                let cr = run.errored_result(message.as_str());
                self.store.write_command_result(&cr).await?;
                execution.main_result_id = Some(cr.id.clone());
                for (kind, _) in &plan.requests {
                    execution.step(*kind, Some(cr.id.clone()), Some(message.clone()));
                }
                execution.fail(reasons::PREPARE_FAILED, message);
                return Ok(());
            }
        };
        status.last_prepare_error.clear();
        status.observed_commit.clone_from(&rendered.commit);
        let hash = objects_hash(&rendered.objects);
        debug!("Rendered {} object(s), hash {}", rendered.objects.len(), hash);

        if plan.request(RequestKind::Diff).is_some() {
            let cr = self
                .run_command(ctx, &rendered, &hash, PipelineCommand::Diff, false, clock)
                .await?;
            status.last_diff_result = Some(cr.build_summary());
            execution.step(RequestKind::Diff, Some(cr.id.clone()), result_error(&cr));
        }

        let mut deployed = false;
        match decide_deploy(spec, status, plan, &hash) {
            DeployDecision::Skip => {
                debug!("Rendered objects unchanged, skipping deploy");
            }
            DeployDecision::AwaitApproval => {
                info!("Manual deployment awaiting approval of hash {}, running dry-run", hash);
                let cr = self.run_command(ctx, &rendered, &hash, deploy_command, true, clock).await?;
                status.last_diff_result = Some(cr.build_summary());
                status.last_objects_hash.clone_from(&hash);
                execution.main_result_id = Some(cr.id.clone());
                let error = result_error(&cr);
                execution.step(
                    RequestKind::Deploy,
                    Some(cr.id.clone()),
                    Some(error.clone().unwrap_or_else(|| "deployment is awaiting manual approval".to_string())),
                );
                if let Some(e) = error {
                    execution.fail(reasons::DEPLOY_FAILED, e);
                }
                execution.awaiting_approval = Some(hash.clone());
            }
            DeployDecision::Deploy { dry_run } => {
                let cr = self.run_command(ctx, &rendered, &hash, deploy_command, dry_run, clock).await?;
                status.last_deploy_result = Some(cr.build_summary());
                status.last_objects_hash.clone_from(&hash);
                if spec.manual && !dry_run {
                    status.last_manual_objects_hash = Some(hash.clone());
                }
                execution.main_result_id = Some(cr.id.clone());
                let error = result_error(&cr);
                execution.step(RequestKind::Deploy, Some(cr.id.clone()), error.clone());
                match error {
                    Some(e) => execution.fail(reasons::DEPLOY_FAILED, e),
                    None => deployed = !dry_run,
                }
            }
        }

        if plan.request(RequestKind::Prune).is_some() || (deployed && spec.prune) {
            let cr = self
                .run_command(ctx, &rendered, &hash, PipelineCommand::Prune, spec.dry_run, clock)
                .await?;
            let error = result_error(&cr);
            execution.step(RequestKind::Prune, Some(cr.id.clone()), error.clone());
            if let Some(e) = error {
                execution.fail(reasons::DEPLOY_FAILED, e);
            }
        }

        let validate_due = spec.validate && (deployed || plan.has_trigger(Trigger::ValidateIntervalElapsed));
        if plan.request(RequestKind::Validate).is_some() || validate_due {
            self.validate(ctx, &rendered, &hash, status, execution, clock).await?;
        }

        self.detect_drift(ctx, &rendered, &hash, status, clock).await?;
        Ok(())
    }

    /// Runs one command and stores its result; pipeline errors become an
    /// errored result
    async fn run_command(
        &self,
        ctx: &PipelineContext,
        rendered: &RenderOutput,
        objects_hash: &str,
        command: PipelineCommand,
        dry_run: bool,
        clock: CycleClock,
    ) -> Result<CommandResult, ControllerError> {
        let start_time = clock.now();
        let output = self.pipeline.run_command(ctx, rendered, command, dry_run).await;
        let run = CommandRun {
            ctx,
            command: command.as_str(),
            dry_run,
            start_time,
            end_time: clock.now(),
            rendered_objects_hash: Some(objects_hash.to_string()),
        };
        let cr = match output {
            Ok(output) => run.command_result(output),
            Err(e) => {
                warn!("{} failed for {}: {}", command, ctx.deployment.name, e);
                run.errored_result(e.to_string())
            }
        };
        self.store.write_command_result(&cr).await?;

        let summary = cr.build_summary();
        info!(
            "{} {} (dry-run: {}): applied={} new={} changed={} orphan={} deleted={} errors={} warnings={}",
            ctx.deployment.name,
            command,
            dry_run,
            summary.applied_objects,
            summary.new_objects,
            summary.changed_objects,
            summary.orphan_objects,
            summary.deleted_objects,
            summary.errors,
            summary.warnings
        );
        Ok(cr)
    }

    async fn validate(
        &self,
        ctx: &PipelineContext,
        rendered: &RenderOutput,
        objects_hash: &str,
        status: &mut KluctlDeploymentStatus,
        execution: &mut Execution,
        clock: CycleClock,
    ) -> Result<(), ControllerError> {
        let start_time = clock.now();
        let output = match self.pipeline.validate(ctx, rendered).await {
            Ok(output) => output,
            Err(e) => ValidateOutput {
                ready: false,
                errors: vec![DeploymentError::global(format!("validation failed: {}", e))],
                ..Default::default()
            },
        };
        let run = CommandRun {
            ctx,
            command: "validate",
            dry_run: false,
            start_time,
            end_time: clock.now(),
            rendered_objects_hash: Some(objects_hash.to_string()),
        };
        let vr = run.validate_result(output);
        self.store.write_validate_result(&vr).await?;
        status.last_validate_result = Some(vr.build_summary());
        status.last_validate_time = Some(start_time);

        let error = if !vr.errors.is_empty() {
            Some(vr.errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join("; "))
        } else if !vr.ready {
            Some(format!("{} object(s) not ready", vr.results.len()))
        } else {
            None
        };
        execution.step(RequestKind::Validate, Some(vr.id.clone()), error.clone());
        if let Some(e) = error {
            execution.fail(reasons::VALIDATE_FAILED, e);
        }
        Ok(())
    }

    /// Drift detection is informational: its failures land in the drift
    /// message, not in the Ready condition
    async fn detect_drift(
        &self,
        ctx: &PipelineContext,
        rendered: &RenderOutput,
        objects_hash: &str,
        status: &mut KluctlDeploymentStatus,
        clock: CycleClock,
    ) -> Result<(), ControllerError> {
        let start_time = clock.now();
        let output = self.pipeline.detect_drift(ctx, rendered).await;
        let run = CommandRun {
            ctx,
            command: "drift-detection",
            dry_run: true,
            start_time,
            end_time: clock.now(),
            rendered_objects_hash: Some(objects_hash.to_string()),
        };
        let (dr, message) = match output {
            Ok(output) => {
                let dr = run.drift_result(output);
                let message = dr.build_short_message();
                (dr, message)
            }
            Err(e) => {
                warn!("Drift detection failed for {}: {}", ctx.deployment.name, e);
                let message = format!("drift detection failed: {}", e);
                let dr = run.drift_result(DriftOutput {
                    errors: vec![DeploymentError::global(message.as_str())],
                    ..Default::default()
                });
                (dr, message)
            }
        };
        self.store.write_drift_detection_result(&dr).await?;
        status.set_last_drift_detection_result(Some(dr.build_summary()), message);
        Ok(())
    }
}

/// Writes the outcome of every handled request into its status channel.
///
/// Requests without an own step get `fallback_error`; the reconcile request
/// points at the main deploy result.
fn record_requests(
    status: &mut KluctlDeploymentStatus,
    plan: &CyclePlan,
    execution: &Execution,
    fallback_error: Option<&str>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    reconcile_id: &str,
) {
    for (kind, request) in &plan.requests {
        let step = execution.steps.get(kind).cloned().unwrap_or_else(|| StepOutcome {
            result_id: if *kind == RequestKind::Reconcile {
                execution.main_result_id.clone()
            } else {
                None
            },
            error: fallback_error.map(ToString::to_string),
        });
        let recorded = record_handled(
            status.request_result(*kind),
            request.clone(),
            start_time,
            end_time,
            reconcile_id,
            step.result_id,
            step.error,
        );
        status.set_request_result(*kind, recorded);
    }
}

#[cfg(test)]
#[path = "cycle_test.rs"]
mod cycle_test;
