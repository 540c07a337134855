//! Render/apply pipeline contract.
//!
//! The controller never renders templates or talks server-side apply itself.
//! It hands a [`PipelineContext`] to a [`DeploymentPipeline`] and records
//! whatever counted outcome comes back. [`ProcessPipeline`] is the production
//! implementation: it runs an engine executable per call, writes one JSON
//! request to its stdin and reads one JSON response from its stdout.

use async_trait::async_trait;
use crds::KluctlDeploymentSpec;
use results::{DeploymentError, KluctlDeploymentInfo, ProjectKey, ResultObject, TargetKey, ValidateResultEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Errors reported by a pipeline call
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The engine reported a failure (render error, source fetch, apply)
    #[error("{0}")]
    Failed(String),

    /// The engine could not be started or talked to
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine answered with something that is not a valid response
    #[error("invalid engine response: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Commands that change (or simulate changing) the target cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineCommand {
    Deploy,
    PokeImages,
    Diff,
    Prune,
}

impl PipelineCommand {
    /// Command name recorded in results
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineCommand::Deploy => "deploy",
            PipelineCommand::PokeImages => "poke-images",
            PipelineCommand::Diff => "diff",
            PipelineCommand::Prune => "prune",
        }
    }
}

impl fmt::Display for PipelineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine needs to know about one reconcile
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineContext {
    pub deployment: KluctlDeploymentInfo,
    pub spec: KluctlDeploymentSpec,
    pub project_key: ProjectKey,
    pub target_key: TargetKey,
    pub reconcile_id: String,
    /// Patch from a manual request, applied to the args for this run only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides_patch: Option<Value>,
    /// Key of the cluster accessor the engine has to target
    pub cluster: String,
    /// User to impersonate on the target cluster
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impersonate: Option<String>,
}

/// Rendered project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOutput {
    /// Source revision the project was rendered from
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub objects: Vec<Value>,
}

/// Counted outcome of a deploy, poke-images, diff or prune
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    #[serde(default)]
    pub objects: Vec<ResultObject>,
    #[serde(default)]
    pub errors: Vec<DeploymentError>,
    #[serde(default)]
    pub warnings: Vec<DeploymentError>,
}

/// Outcome of a validation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateOutput {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub results: Vec<ValidateResultEntry>,
    #[serde(default)]
    pub errors: Vec<DeploymentError>,
    #[serde(default)]
    pub warnings: Vec<DeploymentError>,
}

/// Objects whose live state differs from the rendered state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftOutput {
    #[serde(default)]
    pub objects: Vec<ResultObject>,
    #[serde(default)]
    pub errors: Vec<DeploymentError>,
    #[serde(default)]
    pub warnings: Vec<DeploymentError>,
}

/// External render/apply engine.
///
/// Every call may take long and is cancelled by dropping its future.
#[async_trait]
pub trait DeploymentPipeline: Send + Sync {
    /// Fetches the source and renders all objects of the target
    async fn render(&self, ctx: &PipelineContext) -> Result<RenderOutput, PipelineError>;

    /// Runs `command` against the rendered objects
    async fn run_command(
        &self,
        ctx: &PipelineContext,
        rendered: &RenderOutput,
        command: PipelineCommand,
        dry_run: bool,
    ) -> Result<CommandOutput, PipelineError>;

    /// Checks readiness of the deployed objects
    async fn validate(&self, ctx: &PipelineContext, rendered: &RenderOutput) -> Result<ValidateOutput, PipelineError>;

    /// Compares live state with the rendered objects without changing anything
    async fn detect_drift(&self, ctx: &PipelineContext, rendered: &RenderOutput) -> Result<DriftOutput, PipelineError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EngineRequest<'a> {
    operation: &'static str,
    context: &'a PipelineContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    rendered: Option<&'a RenderOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<PipelineCommand>,
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EngineResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Option<Value>,
}

/// Pipeline backed by an engine executable.
///
/// One process per call; the process is killed when the call is cancelled.
#[derive(Debug, Clone)]
pub struct ProcessPipeline {
    command: String,
}

impl ProcessPipeline {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, request: &EngineRequest<'_>) -> Result<T, PipelineError> {
        let input = serde_json::to_vec(request)?;
        debug!(
            "Running {} {} for {}",
            self.command, request.operation, request.context.deployment.name
        );

        let mut child = Command::new(&self.command)
            .arg(request.operation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // The engine may write to stdout/stderr before it has consumed the
        // whole request, so both pipes are drained while stdin is written.
        let stdin = child.stdin.take();
        let write_request = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (written, output) = tokio::join!(write_request, child.wait_with_output());

        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Failed(format!(
                "{} {} failed ({}): {}",
                self.command,
                request.operation,
                output.status,
                stderr.trim()
            )));
        }
        // An engine that answered successfully without reading its whole
        // request is still broken.
        written?;

        parse_response(&output.stdout)
    }
}

fn parse_response<T: serde::de::DeserializeOwned>(stdout: &[u8]) -> Result<T, PipelineError> {
    let response: EngineResponse =
        serde_json::from_slice(stdout).map_err(|e| PipelineError::Protocol(e.to_string()))?;
    if let Some(error) = response.error {
        return Err(PipelineError::Failed(error));
    }
    let result = response
        .result
        .ok_or_else(|| PipelineError::Protocol("response carries neither result nor error".to_string()))?;
    Ok(serde_json::from_value(result)?)
}

#[async_trait]
impl DeploymentPipeline for ProcessPipeline {
    async fn render(&self, ctx: &PipelineContext) -> Result<RenderOutput, PipelineError> {
        self.call(&EngineRequest {
            operation: "render",
            context: ctx,
            rendered: None,
            command: None,
            dry_run: false,
        })
        .await
    }

    async fn run_command(
        &self,
        ctx: &PipelineContext,
        rendered: &RenderOutput,
        command: PipelineCommand,
        dry_run: bool,
    ) -> Result<CommandOutput, PipelineError> {
        self.call(&EngineRequest {
            operation: "command",
            context: ctx,
            rendered: Some(rendered),
            command: Some(command),
            dry_run,
        })
        .await
    }

    async fn validate(&self, ctx: &PipelineContext, rendered: &RenderOutput) -> Result<ValidateOutput, PipelineError> {
        self.call(&EngineRequest {
            operation: "validate",
            context: ctx,
            rendered: Some(rendered),
            command: None,
            dry_run: false,
        })
        .await
    }

    async fn detect_drift(&self, ctx: &PipelineContext, rendered: &RenderOutput) -> Result<DriftOutput, PipelineError> {
        self.call(&EngineRequest {
            operation: "drift",
            context: ctx,
            rendered: Some(rendered),
            command: None,
            dry_run: true,
        })
        .await
    }
}
