//! Test utilities for unit testing the reconciler
//!
//! Builders for deployments and specs plus a scripted pipeline that records
//! every call it receives.

use crate::pipeline::{
    CommandOutput, DeploymentPipeline, DriftOutput, PipelineCommand, PipelineContext, PipelineError, RenderOutput,
    ValidateOutput,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use crds::{KluctlDeployment, KluctlDeploymentSpec, ManualRequest, RequestKind};
use results::KluctlDeploymentInfo;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Fixed point in time, `secs` seconds after an arbitrary epoch
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Annotation carrying a manual request with `token`
pub fn request_annotation(kind: RequestKind, token: &str) -> (String, String) {
    (
        kind.annotation().to_string(),
        ManualRequest::new(token).encode().unwrap(),
    )
}

/// Git sourced spec with a 5m interval
pub fn test_spec() -> KluctlDeploymentSpec {
    serde_json::from_value(json!({
        "source": {
            "git": {
                "url": "https://github.com/kluctl/kluctl-examples.git",
                "path": "simple"
            }
        },
        "interval": "5m"
    }))
    .unwrap()
}

/// Deployment in namespace `default` at generation 1
pub fn test_deployment(name: &str, spec: KluctlDeploymentSpec) -> KluctlDeployment {
    let mut obj = KluctlDeployment::new(name, spec);
    obj.metadata.namespace = Some("default".to_string());
    obj.metadata.generation = Some(1);
    obj
}

pub fn pipeline_context(spec: KluctlDeploymentSpec) -> PipelineContext {
    PipelineContext {
        deployment: KluctlDeploymentInfo {
            name: "test".to_string(),
            namespace: "default".to_string(),
            generation: 1,
        },
        project_key: spec.project_key().unwrap(),
        target_key: spec.target_key(Some("cluster-1".to_string())),
        spec,
        reconcile_id: "reconcile-1".to_string(),
        overrides_patch: None,
        cluster: "in-cluster".to_string(),
        impersonate: None,
    }
}

/// A call received by [`MockPipeline`]
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineCall {
    pub operation: &'static str,
    pub command: Option<PipelineCommand>,
    pub dry_run: bool,
    pub overrides_patch: Option<Value>,
}

#[derive(Default)]
struct MockState {
    commit: String,
    objects: Vec<Value>,
    render_error: Option<String>,
    command_outputs: HashMap<PipelineCommand, CommandOutput>,
    command_errors: HashMap<PipelineCommand, String>,
    validate: Option<ValidateOutput>,
    drift: DriftOutput,
    delay: Option<Duration>,
    calls: Vec<PipelineCall>,
}

/// Scripted pipeline.
///
/// Renders the configured objects, answers commands with the configured
/// outputs (empty by default) and validates as ready unless told otherwise.
#[derive(Default)]
pub struct MockPipeline {
    state: Mutex<MockState>,
}

impl MockPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_objects(&self, commit: &str, objects: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        state.commit = commit.to_string();
        state.objects = objects;
    }

    pub fn set_command_output(&self, command: PipelineCommand, output: CommandOutput) {
        self.state.lock().unwrap().command_outputs.insert(command, output);
    }

    pub fn fail_render(&self, message: &str) {
        self.state.lock().unwrap().render_error = Some(message.to_string());
    }

    pub fn fail_command(&self, command: PipelineCommand, message: &str) {
        self.state.lock().unwrap().command_errors.insert(command, message.to_string());
    }

    pub fn set_validate(&self, output: ValidateOutput) {
        self.state.lock().unwrap().validate = Some(output);
    }

    pub fn set_drift(&self, output: DriftOutput) {
        self.state.lock().unwrap().drift = output;
    }

    /// Makes every render sleep for `delay`
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<PipelineCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Number of `command` runs with the given dry-run flag
    pub fn command_count(&self, command: PipelineCommand, dry_run: bool) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.command == Some(command) && c.dry_run == dry_run)
            .count()
    }

    pub fn operation_count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|c| c.operation == operation).count()
    }

    fn record(&self, ctx: &PipelineContext, operation: &'static str, command: Option<PipelineCommand>, dry_run: bool) {
        self.state.lock().unwrap().calls.push(PipelineCall {
            operation,
            command,
            dry_run,
            overrides_patch: ctx.overrides_patch.clone(),
        });
    }
}

#[async_trait]
impl DeploymentPipeline for MockPipeline {
    async fn render(&self, ctx: &PipelineContext) -> Result<RenderOutput, PipelineError> {
        self.record(ctx, "render", None, false);
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        if let Some(e) = &state.render_error {
            return Err(PipelineError::Failed(e.clone()));
        }
        Ok(RenderOutput {
            commit: state.commit.clone(),
            objects: state.objects.clone(),
        })
    }

    async fn run_command(
        &self,
        ctx: &PipelineContext,
        _rendered: &RenderOutput,
        command: PipelineCommand,
        dry_run: bool,
    ) -> Result<CommandOutput, PipelineError> {
        self.record(ctx, "command", Some(command), dry_run);
        let state = self.state.lock().unwrap();
        if let Some(e) = state.command_errors.get(&command) {
            return Err(PipelineError::Failed(e.clone()));
        }
        Ok(state.command_outputs.get(&command).cloned().unwrap_or_default())
    }

    async fn validate(&self, ctx: &PipelineContext, _rendered: &RenderOutput) -> Result<ValidateOutput, PipelineError> {
        self.record(ctx, "validate", None, false);
        let state = self.state.lock().unwrap();
        Ok(state.validate.clone().unwrap_or(ValidateOutput {
            ready: true,
            ..Default::default()
        }))
    }

    async fn detect_drift(&self, ctx: &PipelineContext, _rendered: &RenderOutput) -> Result<DriftOutput, PipelineError> {
        self.record(ctx, "drift", None, true);
        Ok(self.state.lock().unwrap().drift.clone())
    }
}
